use anchor_lang::prelude::*;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{self, Mint, Token, TokenAccount, Transfer};

declare_id!("Levr111111111111111111111111111111111111111");

/// Leftover debt tokens at or below this tolerance (0.01 token) are
/// absorbed rather than forwarded, so callers never need exact-change swaps
pub const MAX_LEFTOVER: u64 = 10_000;

// Leverage Orchestrator composes the debt token's flash loan, the external
// swap venue, and the position engine's adjustment into one atomic
// instruction. The caller never pre-funds the swap leg.
#[program]
pub mod leverage_orchestrator {
    use super::*;

    /// Create the orchestrator config, its authority PDA, and its working
    /// token accounts. One-time.
    pub fn initialize(ctx: Context<Initialize>) -> Result<()> {
        let config = &mut ctx.accounts.config;
        config.collateral_mint = ctx.accounts.collateral_mint.key();
        config.debt_mint = ctx.accounts.debt_mint.key();
        config.loan_in_flight = false;
        config.authority_bump = ctx.bumps.orchestrator_authority;
        msg!(
            "✅ Orchestrator initialized, authority {}",
            ctx.accounts.orchestrator_authority.key()
        );
        Ok(())
    }

    /// Change a position's leverage in one atomic sequence:
    /// flash-borrow `debt_change`, swap, apply a single net adjustment,
    /// forward removed principal and any leftover, repay the loan.
    ///
    /// `swap_guard_amount` is the minimum acceptable swap output when
    /// increasing leverage, and the exact collateral amount to withdraw and
    /// swap back when decreasing.
    pub fn leverage_adjust(
        ctx: Context<LeverageAdjust>,
        debt_change: u64,
        is_debt_increase: bool,
        principal_change: u64,
        principal_is_deposit: bool,
        swap_guard_amount: u64,
        max_fee_bps: u64,
        hint_high: Pubkey,
        hint_low: Pubkey,
        venue_payload: Vec<u8>,
    ) -> Result<()> {
        require!(debt_change > 0, OrchestratorError::ZeroLoanAmount);
        require!(
            !ctx.accounts.config.loan_in_flight,
            OrchestratorError::LoanAlreadyInFlight
        );

        let authority_bump = ctx.accounts.config.authority_bump;
        let seeds = &[b"orchestrator_authority".as_ref(), &[authority_bump]];
        let signer_seeds = &[&seeds[..]];

        // STEP 1: Pull added principal from the caller up front
        if principal_is_deposit && principal_change > 0 {
            token::transfer(
                CpiContext::new(
                    ctx.accounts.token_program.to_account_info(),
                    Transfer {
                        from: ctx.accounts.user_collateral_ata.to_account_info(),
                        to: ctx.accounts.orchestrator_collateral_ata.to_account_info(),
                        authority: ctx.accounts.user.to_account_info(),
                    },
                ),
                principal_change,
            )?;
        }

        // STEP 2: Flash-borrow the debt token; the guard stays armed until
        // settle in this same instruction
        ctx.accounts.config.loan_in_flight = true;
        position_engine::cpi::issue_flash_loan(
            CpiContext::new_with_signer(
                ctx.accounts.position_engine_program.to_account_info(),
                position_engine::cpi::accounts::IssueFlashLoan {
                    config: ctx.accounts.engine_config.to_account_info(),
                    flash_loan: ctx.accounts.flash_loan.to_account_info(),
                    debt_mint: ctx.accounts.debt_mint.to_account_info(),
                    borrower: ctx.accounts.orchestrator_authority.to_account_info(),
                    borrower_debt_ata: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                    protocol_authority: ctx.accounts.protocol_authority.to_account_info(),
                    token_program: ctx.accounts.token_program.to_account_info(),
                },
                signer_seeds,
            ),
            debt_change,
        )?;
        let loan = read_loan_state(&ctx.accounts.flash_loan)?;
        let repayment = loan
            .amount
            .checked_add(loan.fee)
            .ok_or(OrchestratorError::MathOverflow)?;

        // STEP 3: Increasing leverage swaps the borrowed debt into
        // collateral now; decreasing takes the guard value as the exact
        // amount to pull out of the position and swap back later
        let leveraged_collateral = if is_debt_increase {
            ctx.accounts.orchestrator_collateral_ata.reload()?;
            let before = ctx.accounts.orchestrator_collateral_ata.amount;
            swap_venue::cpi::swap(
                CpiContext::new_with_signer(
                    ctx.accounts.swap_venue_program.to_account_info(),
                    swap_venue::cpi::accounts::Swap {
                        pool: ctx.accounts.swap_pool.to_account_info(),
                        user_source: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                        user_destination: ctx
                            .accounts
                            .orchestrator_collateral_ata
                            .to_account_info(),
                        vault_in: ctx.accounts.venue_quote_vault.to_account_info(),
                        vault_out: ctx.accounts.venue_base_vault.to_account_info(),
                        user_authority: ctx.accounts.orchestrator_authority.to_account_info(),
                        token_program: ctx.accounts.token_program.to_account_info(),
                    },
                    signer_seeds,
                ),
                debt_change,
                swap_guard_amount,
                venue_payload.clone(),
            )?;
            ctx.accounts.orchestrator_collateral_ata.reload()?;
            let received = ctx
                .accounts
                .orchestrator_collateral_ata
                .amount
                .checked_sub(before)
                .ok_or(OrchestratorError::MathOverflow)?;
            require!(
                received >= swap_guard_amount,
                OrchestratorError::SwapOutputBelowGuard
            );
            received
        } else {
            swap_guard_amount
        };

        // STEP 4: Net the principal and leveraged changes into the single
        // adjustment the engine will validate
        let delta = reconcile_collateral_delta(
            principal_change,
            principal_is_deposit,
            leveraged_collateral,
            is_debt_increase,
        );
        let (collateral_deposit, collateral_withdrawal) = match delta {
            CollateralDelta::Increase(amount) => (amount, 0),
            CollateralDelta::Decrease(amount) => (0, amount),
            CollateralDelta::Unchanged => (0, 0),
        };
        msg!(
            "Net collateral delta: +{} / -{} ({} leveraged, {} principal)",
            collateral_deposit,
            collateral_withdrawal,
            leveraged_collateral,
            principal_change
        );

        // STEP 5: The engine enforces every position invariant here; any
        // failure unwinds the loan, the swap, and the pulled principal
        position_engine::cpi::adjust_position(
            CpiContext::new_with_signer(
                ctx.accounts.position_engine_program.to_account_info(),
                position_engine::cpi::accounts::AdjustPosition {
                    config: ctx.accounts.engine_config.to_account_info(),
                    position: ctx.accounts.position.to_account_info(),
                    owner: ctx.accounts.user.to_account_info(),
                    price_feed: ctx.accounts.price_feed.to_account_info(),
                    collateral_mint: ctx.accounts.collateral_mint.to_account_info(),
                    debt_mint: ctx.accounts.debt_mint.to_account_info(),
                    protocol_authority: ctx.accounts.protocol_authority.to_account_info(),
                    collateral_vault: ctx.accounts.collateral_vault.to_account_info(),
                    collateral_source: ctx
                        .accounts
                        .orchestrator_collateral_ata
                        .to_account_info(),
                    collateral_destination: ctx
                        .accounts
                        .orchestrator_collateral_ata
                        .to_account_info(),
                    debt_source: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                    debt_destination: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                    funds_authority: ctx.accounts.orchestrator_authority.to_account_info(),
                    token_program: ctx.accounts.token_program.to_account_info(),
                },
                signer_seeds,
            ),
            collateral_deposit,
            collateral_withdrawal,
            debt_change,
            is_debt_increase,
            max_fee_bps,
            hint_high,
            hint_low,
        )?;

        // STEP 6: Removed principal was never deposited; forward it now
        if !principal_is_deposit && principal_change > 0 {
            token::transfer(
                CpiContext::new_with_signer(
                    ctx.accounts.token_program.to_account_info(),
                    Transfer {
                        from: ctx.accounts.orchestrator_collateral_ata.to_account_info(),
                        to: ctx.accounts.user_collateral_ata.to_account_info(),
                        authority: ctx.accounts.orchestrator_authority.to_account_info(),
                    },
                    signer_seeds,
                ),
                principal_change,
            )?;
        }

        // STEP 7: Decreasing leverage swaps the withdrawn collateral back,
        // requiring enough output to cover principal plus fee
        if !is_debt_increase {
            swap_venue::cpi::swap(
                CpiContext::new_with_signer(
                    ctx.accounts.swap_venue_program.to_account_info(),
                    swap_venue::cpi::accounts::Swap {
                        pool: ctx.accounts.swap_pool.to_account_info(),
                        user_source: ctx
                            .accounts
                            .orchestrator_collateral_ata
                            .to_account_info(),
                        user_destination: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                        vault_in: ctx.accounts.venue_base_vault.to_account_info(),
                        vault_out: ctx.accounts.venue_quote_vault.to_account_info(),
                        user_authority: ctx.accounts.orchestrator_authority.to_account_info(),
                        token_program: ctx.accounts.token_program.to_account_info(),
                    },
                    signer_seeds,
                ),
                leveraged_collateral,
                repayment,
                venue_payload.clone(),
            )?;
        }

        // STEP 8: Forward any leftover above the dust tolerance, then repay
        ctx.accounts.orchestrator_debt_ata.reload()?;
        let balance = ctx.accounts.orchestrator_debt_ata.amount;
        require!(balance >= repayment, OrchestratorError::LoanRepaymentShortfall);
        let leftover = balance - repayment;
        let leftover_forwarded = if leftover > MAX_LEFTOVER {
            token::transfer(
                CpiContext::new_with_signer(
                    ctx.accounts.token_program.to_account_info(),
                    Transfer {
                        from: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                        to: ctx.accounts.user_debt_ata.to_account_info(),
                        authority: ctx.accounts.orchestrator_authority.to_account_info(),
                    },
                    signer_seeds,
                ),
                leftover,
            )?;
            leftover
        } else {
            0
        };

        position_engine::cpi::settle_flash_loan(CpiContext::new_with_signer(
            ctx.accounts.position_engine_program.to_account_info(),
            position_engine::cpi::accounts::SettleFlashLoan {
                config: ctx.accounts.engine_config.to_account_info(),
                flash_loan: ctx.accounts.flash_loan.to_account_info(),
                debt_mint: ctx.accounts.debt_mint.to_account_info(),
                borrower: ctx.accounts.orchestrator_authority.to_account_info(),
                borrower_debt_ata: ctx.accounts.orchestrator_debt_ata.to_account_info(),
                token_program: ctx.accounts.token_program.to_account_info(),
            },
            signer_seeds,
        ))?;
        ctx.accounts.config.loan_in_flight = false;
        msg!("✅ Leverage adjusted, {} leftover forwarded", leftover_forwarded);

        let clock = Clock::get()?;
        emit!(LeverageAdjusted {
            user: ctx.accounts.user.key(),
            debt_change,
            is_debt_increase,
            principal_change,
            principal_is_deposit,
            leveraged_collateral,
            leftover_forwarded,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }
}

// ========== RECONCILIATION ==========

/// Net collateral change handed to the adjustment engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollateralDelta {
    Increase(u64),
    Decrease(u64),
    Unchanged,
}

/// Net a principal change against a leveraged change. The two
/// disagreeing-direction branches are intentionally distinct: removed
/// principal against added leverage resolves by whether the leveraged
/// magnitude exceeds the principal, and the opposite pairing resolves the
/// mirrored way. Equal opposing magnitudes leave the collateral unchanged.
pub fn reconcile_collateral_delta(
    principal_amount: u64,
    principal_is_deposit: bool,
    leveraged_amount: u64,
    leverage_adds_collateral: bool,
) -> CollateralDelta {
    if principal_is_deposit == leverage_adds_collateral {
        let total = principal_amount.saturating_add(leveraged_amount);
        if total == 0 {
            CollateralDelta::Unchanged
        } else if principal_is_deposit {
            CollateralDelta::Increase(total)
        } else {
            CollateralDelta::Decrease(total)
        }
    } else if !principal_is_deposit && leverage_adds_collateral {
        if leveraged_amount > principal_amount {
            CollateralDelta::Increase(leveraged_amount - principal_amount)
        } else if principal_amount > leveraged_amount {
            CollateralDelta::Decrease(principal_amount - leveraged_amount)
        } else {
            CollateralDelta::Unchanged
        }
    } else {
        if leveraged_amount > principal_amount {
            CollateralDelta::Decrease(leveraged_amount - principal_amount)
        } else if principal_amount > leveraged_amount {
            CollateralDelta::Increase(principal_amount - leveraged_amount)
        } else {
            CollateralDelta::Unchanged
        }
    }
}

fn read_loan_state(info: &UncheckedAccount) -> Result<position_engine::FlashLoan> {
    let data = info.try_borrow_data()?;
    let mut slice: &[u8] = &data;
    position_engine::FlashLoan::try_deserialize(&mut slice)
}

// ========== ACCOUNTS ==========

#[derive(Accounts)]
pub struct Initialize<'info> {
    #[account(
        init,
        payer = payer,
        space = 8 + OrchestratorConfig::LEN,
        seeds = [b"orchestrator_config"],
        bump
    )]
    pub config: Account<'info, OrchestratorConfig>,

    /// CHECK: PDA signing the orchestrator's loans, swaps, and transfers
    #[account(seeds = [b"orchestrator_authority"], bump)]
    pub orchestrator_authority: UncheckedAccount<'info>,

    pub collateral_mint: Account<'info, Mint>,
    pub debt_mint: Account<'info, Mint>,

    /// Working collateral account for in-flight sequences
    #[account(
        init,
        payer = payer,
        associated_token::mint = collateral_mint,
        associated_token::authority = orchestrator_authority
    )]
    pub orchestrator_collateral_ata: Account<'info, TokenAccount>,

    /// Working debt account for in-flight sequences
    #[account(
        init,
        payer = payer,
        associated_token::mint = debt_mint,
        associated_token::authority = orchestrator_authority
    )]
    pub orchestrator_debt_ata: Account<'info, TokenAccount>,

    #[account(mut)]
    pub payer: Signer<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct LeverageAdjust<'info> {
    #[account(mut, seeds = [b"orchestrator_config"], bump)]
    pub config: Account<'info, OrchestratorConfig>,

    /// CHECK: PDA signing the orchestrator's loans, swaps, and transfers
    #[account(seeds = [b"orchestrator_authority"], bump = config.authority_bump)]
    pub orchestrator_authority: UncheckedAccount<'info>,

    /// Position owner; their signature flows through to the engine
    pub user: Signer<'info>,

    // ===== POSITION ENGINE ACCOUNTS (validated by the engine) =====
    /// CHECK: engine protocol config PDA
    #[account(mut)]
    pub engine_config: UncheckedAccount<'info>,

    /// CHECK: user's position PDA
    #[account(mut)]
    pub position: UncheckedAccount<'info>,

    /// CHECK: engine price feed
    pub price_feed: UncheckedAccount<'info>,

    /// CHECK: engine flash-loan guard PDA
    #[account(mut)]
    pub flash_loan: UncheckedAccount<'info>,

    /// CHECK: engine vault authority PDA
    pub protocol_authority: UncheckedAccount<'info>,

    /// CHECK: engine collateral vault
    #[account(mut)]
    pub collateral_vault: UncheckedAccount<'info>,

    #[account(address = config.collateral_mint)]
    pub collateral_mint: Account<'info, Mint>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    // ===== ORCHESTRATOR WORKING ACCOUNTS =====
    #[account(
        mut,
        associated_token::mint = collateral_mint,
        associated_token::authority = orchestrator_authority
    )]
    pub orchestrator_collateral_ata: Account<'info, TokenAccount>,

    #[account(
        mut,
        associated_token::mint = debt_mint,
        associated_token::authority = orchestrator_authority
    )]
    pub orchestrator_debt_ata: Account<'info, TokenAccount>,

    // ===== CALLER ACCOUNTS =====
    #[account(
        mut,
        constraint = user_collateral_ata.owner == user.key(),
        constraint = user_collateral_ata.mint == collateral_mint.key()
    )]
    pub user_collateral_ata: Account<'info, TokenAccount>,

    #[account(
        mut,
        constraint = user_debt_ata.owner == user.key(),
        constraint = user_debt_ata.mint == debt_mint.key()
    )]
    pub user_debt_ata: Account<'info, TokenAccount>,

    // ===== SWAP VENUE ACCOUNTS (validated by the venue) =====
    /// CHECK: venue pool PDA
    pub swap_pool: UncheckedAccount<'info>,

    /// CHECK: venue collateral-side vault
    #[account(mut)]
    pub venue_base_vault: UncheckedAccount<'info>,

    /// CHECK: venue debt-side vault
    #[account(mut)]
    pub venue_quote_vault: UncheckedAccount<'info>,

    pub position_engine_program: Program<'info, position_engine::program::PositionEngine>,
    pub swap_venue_program: Program<'info, swap_venue::program::SwapVenue>,
    pub token_program: Program<'info, Token>,
}

// ========== STATE ==========

#[account]
pub struct OrchestratorConfig {
    pub collateral_mint: Pubkey,
    pub debt_mint: Pubkey,
    /// In-flight loan guard across the CPI chain
    pub loan_in_flight: bool,
    pub authority_bump: u8,
}

impl OrchestratorConfig {
    pub const LEN: usize = 32 * 2 + 1 + 1;
}

// ========== EVENTS ==========

#[event]
pub struct LeverageAdjusted {
    pub user: Pubkey,
    pub debt_change: u64,
    pub is_debt_increase: bool,
    pub principal_change: u64,
    pub principal_is_deposit: bool,
    pub leveraged_collateral: u64,
    pub leftover_forwarded: u64,
    pub timestamp: i64,
}

// ========== ERRORS ==========

#[error_code]
pub enum OrchestratorError {
    #[msg("Loan amount must be non-zero")]
    ZeroLoanAmount,
    #[msg("A leverage sequence is already in flight")]
    LoanAlreadyInFlight,
    #[msg("Swap output below the caller's guard")]
    SwapOutputBelowGuard,
    #[msg("Post-swap balance does not cover loan principal plus fee")]
    LoanRepaymentShortfall,
    #[msg("Overflow during math operation")]
    MathOverflow,
}
