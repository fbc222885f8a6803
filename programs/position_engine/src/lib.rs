use anchor_lang::prelude::*;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{self, Burn, Mint, MintTo, Token, TokenAccount, Transfer};

declare_id!("Pos1111111111111111111111111111111111111111");

// ========== PROTOCOL CONSTANTS ==========
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Minimum collateralization ratio for an active position (110%)
pub const MCR_BPS: u64 = 11_000;

/// Fixed reserve debt (6 dp) set aside per position for liquidation gas
pub const GAS_COMPENSATION: u64 = 200_000_000;

/// Minimum user-facing net debt (6 dp) for an active position
pub const MIN_NET_DEBT: u64 = 1_800_000_000;

/// Borrowing fee floor (0.5%) and cap (5%)
pub const BORROWING_FEE_FLOOR_BPS: u64 = 50;
pub const MAX_BORROWING_FEE_BPS: u64 = 500;

/// Flash-loan fee cap (1%)
pub const MAX_FLASH_FEE_BPS: u64 = 100;

/// Collateral token uses 9 decimals
pub const COLLATERAL_SCALE: u128 = 1_000_000_000;

/// Price-independent ordering ratio scale
pub const ORDERING_RATIO_PRECISION: u128 = 1_000_000;

/// 1e-9 fixed point used by the base-rate decay math
pub const DECIMAL_PRECISION: u128 = 1_000_000_000;

/// Per-minute base-rate decay factor (12-hour half life), 1e-9 fixed point
pub const MINUTE_DECAY_FACTOR: u128 = 999_037_648;

/// Decay exponent cap (1000 years of minutes)
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

pub const SECONDS_PER_MINUTE: i64 = 60;

// Position Engine implements the collateral/debt position ledger: open,
// combined adjustment, and close, plus the debt token's flash-loan primitive
// consumed by the leverage orchestrator.
#[program]
pub mod position_engine {
    use super::*;

    /// Initialize protocol configuration, vaults, and the flash-loan guard
    /// SECURITY: Must be called once during deployment
    pub fn initialize_protocol(
        ctx: Context<InitializeProtocol>,
        orchestrator_authority: Pubkey,
        flash_fee_bps: u64,
    ) -> Result<()> {
        require!(flash_fee_bps <= MAX_FLASH_FEE_BPS, EngineError::InvalidFlashFee);
        require!(
            orchestrator_authority != Pubkey::default(),
            EngineError::Unauthorized
        );

        let clock = Clock::get()?;
        let config = &mut ctx.accounts.config;
        config.admin = ctx.accounts.admin.key();
        config.collateral_mint = ctx.accounts.collateral_mint.key();
        config.debt_mint = ctx.accounts.debt_mint.key();
        config.price_feed = ctx.accounts.price_feed.key();
        config.orchestrator_authority = orchestrator_authority;
        config.flash_fee_bps = flash_fee_bps;
        config.base_rate_bps = 0;
        config.last_fee_decay_ts = clock.unix_timestamp;
        config.total_active_collateral = 0;
        config.total_active_debt = 0;
        config.total_stakes = 0;
        config.coll_reward_per_stake = 0;
        config.debt_reward_per_stake = 0;
        config.paused = false;
        config.authority_bump = ctx.bumps.protocol_authority;

        let flash_loan = &mut ctx.accounts.flash_loan;
        flash_loan.active = false;
        flash_loan.borrower = Pubkey::default();
        flash_loan.amount = 0;
        flash_loan.fee = 0;

        msg!("✅ Protocol initialized with admin: {}", config.admin);
        emit!(ProtocolInitialized {
            admin: config.admin,
            collateral_mint: config.collateral_mint,
            debt_mint: config.debt_mint,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    /// Open a position: pull collateral into the vault, mint the requested
    /// debt to the caller and the gas reserve to the gas pool.
    pub fn open_position(
        ctx: Context<OpenPosition>,
        collateral_amount: u64,
        debt_amount: u64,
        max_fee_bps: u64,
        hint_high: Pubkey,
        hint_low: Pubkey,
    ) -> Result<()> {
        require!(!ctx.accounts.config.paused, EngineError::ProtocolPaused);
        require!(
            ctx.accounts.position.status != PositionStatus::Active,
            EngineError::PositionAlreadyActive
        );

        let clock = Clock::get()?;
        let price = oracle_price(&ctx.accounts.price_feed)?;

        // STEP 1: Fee at the current decayed base rate
        let rate = {
            let config = &mut ctx.accounts.config;
            decay_base_rate(config, clock.unix_timestamp)
        };
        let outcome = evaluate_open(
            collateral_amount,
            debt_amount,
            borrowing_rate_bps(rate),
            max_fee_bps,
            price,
        )?;
        msg!(
            "Opening position: {} collateral, {} debt ({} fee), ratio {} bps",
            collateral_amount,
            outcome.composite_debt,
            outcome.fee,
            outcome.ratio_bps
        );

        // STEP 2: Record the position and update pool accounting
        {
            let config = &mut ctx.accounts.config;
            let position = &mut ctx.accounts.position;
            position.owner = ctx.accounts.owner.key();
            position.collateral = collateral_amount;
            position.debt = outcome.composite_debt;
            position.ordering_ratio = outcome.ordering_ratio;
            position.coll_reward_snapshot = config.coll_reward_per_stake;
            position.debt_reward_snapshot = config.debt_reward_per_stake;
            position.status = PositionStatus::Active;
            update_stake(config, position)?;

            config.total_active_collateral = config
                .total_active_collateral
                .checked_add(collateral_amount)
                .ok_or(EngineError::MathOverflow)?;
            config.total_active_debt = config
                .total_active_debt
                .checked_add(outcome.composite_debt)
                .ok_or(EngineError::MathOverflow)?;
        }

        // STEP 3: Pull collateral from the caller into the vault
        token::transfer(
            CpiContext::new(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.owner_collateral_ata.to_account_info(),
                    to: ctx.accounts.collateral_vault.to_account_info(),
                    authority: ctx.accounts.owner.to_account_info(),
                },
            ),
            collateral_amount,
        )?;

        // STEP 4: Mint the requested debt to the caller and the reserve to
        // the gas pool
        let authority_bump = ctx.accounts.config.authority_bump;
        let seeds = &[b"protocol_authority".as_ref(), &[authority_bump]];
        let signer_seeds = &[&seeds[..]];

        token::mint_to(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                MintTo {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    to: ctx.accounts.owner_debt_ata.to_account_info(),
                    authority: ctx.accounts.protocol_authority.to_account_info(),
                },
                signer_seeds,
            ),
            debt_amount,
        )?;
        token::mint_to(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                MintTo {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    to: ctx.accounts.gas_pool.to_account_info(),
                    authority: ctx.accounts.protocol_authority.to_account_info(),
                },
                signer_seeds,
            ),
            GAS_COMPENSATION,
        )?;
        msg!("✅ Position opened");

        let owner = ctx.accounts.owner.key();
        let position = &ctx.accounts.position;
        emit!(BorrowingFeePaid {
            owner,
            fee: outcome.fee,
            timestamp: clock.unix_timestamp,
        });
        emit!(PositionCreated {
            owner,
            ordering_ratio: outcome.ordering_ratio,
            timestamp: clock.unix_timestamp,
        });
        emit!(PositionUpdated {
            owner,
            debt: position.debt,
            collateral: position.collateral,
            stake: position.stake,
            operation: PositionOperation::Open,
            timestamp: clock.unix_timestamp,
        });
        emit!(RankingUpdated {
            owner,
            ordering_ratio: outcome.ordering_ratio,
            hint_high,
            hint_low,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    /// Apply one combined (collateral delta, debt delta) change to the
    /// caller's position. Exactly one collateral direction may be non-zero,
    /// and a no-op request is rejected.
    pub fn adjust_position(
        ctx: Context<AdjustPosition>,
        collateral_deposit: u64,
        collateral_withdrawal: u64,
        debt_change: u64,
        is_debt_increase: bool,
        max_fee_bps: u64,
        hint_high: Pubkey,
        hint_low: Pubkey,
    ) -> Result<()> {
        require!(!ctx.accounts.config.paused, EngineError::ProtocolPaused);
        require!(
            ctx.accounts.position.status == PositionStatus::Active,
            EngineError::PositionNotActive
        );

        let clock = Clock::get()?;
        let price = oracle_price(&ctx.accounts.price_feed)?;
        let debt_token_balance = ctx.accounts.debt_source.amount;

        let request = AdjustmentRequest {
            collateral_deposit,
            collateral_withdrawal,
            debt_change,
            is_debt_increase,
            max_fee_bps,
        };

        let outcome = {
            let config = &mut ctx.accounts.config;
            let position = &mut ctx.accounts.position;

            // Redistribution is settled first so the adjustment reads the
            // position's true balances
            apply_pending_rewards(config, position)?;

            let rate = if is_debt_increase {
                decay_base_rate(config, clock.unix_timestamp)
            } else {
                config.base_rate_bps
            };

            let outcome = evaluate_adjustment(
                position.collateral,
                position.debt,
                &request,
                borrowing_rate_bps(rate),
                price,
                debt_token_balance,
            )?;
            msg!(
                "Adjusting position: ratio {} -> {} bps, debt {} -> {}",
                outcome.previous_ratio_bps,
                outcome.new_ratio_bps,
                position.debt,
                outcome.new_debt
            );

            position.collateral = outcome.new_collateral;
            position.debt = outcome.new_debt;
            position.ordering_ratio = outcome.ordering_ratio;
            update_stake(config, position)?;

            // Pool liability moves by the fee-inclusive debt delta
            if is_debt_increase {
                let liability = debt_change
                    .checked_add(outcome.fee)
                    .ok_or(EngineError::MathOverflow)?;
                config.total_active_debt = config
                    .total_active_debt
                    .checked_add(liability)
                    .ok_or(EngineError::MathOverflow)?;
            } else if debt_change > 0 {
                config.total_active_debt = config
                    .total_active_debt
                    .checked_sub(debt_change)
                    .ok_or(EngineError::MathOverflow)?;
            }
            config.total_active_collateral = config
                .total_active_collateral
                .checked_add(collateral_deposit)
                .and_then(|c| c.checked_sub(collateral_withdrawal))
                .ok_or(EngineError::MathOverflow)?;

            outcome
        };

        let authority_bump = ctx.accounts.config.authority_bump;
        let seeds = &[b"protocol_authority".as_ref(), &[authority_bump]];
        let signer_seeds = &[&seeds[..]];

        // STEP 1: Collateral movement
        if collateral_deposit > 0 {
            token::transfer(
                CpiContext::new(
                    ctx.accounts.token_program.to_account_info(),
                    Transfer {
                        from: ctx.accounts.collateral_source.to_account_info(),
                        to: ctx.accounts.collateral_vault.to_account_info(),
                        authority: ctx.accounts.funds_authority.to_account_info(),
                    },
                ),
                collateral_deposit,
            )?;
        }
        if collateral_withdrawal > 0 {
            token::transfer(
                CpiContext::new_with_signer(
                    ctx.accounts.token_program.to_account_info(),
                    Transfer {
                        from: ctx.accounts.collateral_vault.to_account_info(),
                        to: ctx.accounts.collateral_destination.to_account_info(),
                        authority: ctx.accounts.protocol_authority.to_account_info(),
                    },
                    signer_seeds,
                ),
                collateral_withdrawal,
            )?;
        }

        // STEP 2: Debt movement — the fee is accounted as position debt and
        // pool liability but never minted
        if is_debt_increase {
            token::mint_to(
                CpiContext::new_with_signer(
                    ctx.accounts.token_program.to_account_info(),
                    MintTo {
                        mint: ctx.accounts.debt_mint.to_account_info(),
                        to: ctx.accounts.debt_destination.to_account_info(),
                        authority: ctx.accounts.protocol_authority.to_account_info(),
                    },
                    signer_seeds,
                ),
                debt_change,
            )?;
        } else if debt_change > 0 {
            token::burn(
                CpiContext::new(
                    ctx.accounts.token_program.to_account_info(),
                    Burn {
                        mint: ctx.accounts.debt_mint.to_account_info(),
                        from: ctx.accounts.debt_source.to_account_info(),
                        authority: ctx.accounts.funds_authority.to_account_info(),
                    },
                ),
                debt_change,
            )?;
        }

        let owner = ctx.accounts.owner.key();
        let position = &ctx.accounts.position;
        if is_debt_increase {
            emit!(BorrowingFeePaid {
                owner,
                fee: outcome.fee,
                timestamp: clock.unix_timestamp,
            });
        }
        emit!(PositionUpdated {
            owner,
            debt: position.debt,
            collateral: position.collateral,
            stake: position.stake,
            operation: PositionOperation::Adjust,
            timestamp: clock.unix_timestamp,
        });
        emit!(RankingUpdated {
            owner,
            ordering_ratio: outcome.ordering_ratio,
            hint_high,
            hint_low,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    /// Close the caller's position: burn its net debt from the caller and
    /// the reserve from the gas pool, then return all collateral.
    pub fn close_position(ctx: Context<ClosePosition>) -> Result<()> {
        require!(!ctx.accounts.config.paused, EngineError::ProtocolPaused);
        require!(
            ctx.accounts.position.status == PositionStatus::Active,
            EngineError::PositionNotActive
        );

        let clock = Clock::get()?;
        let (collateral, repayment) = {
            let config = &mut ctx.accounts.config;
            let position = &mut ctx.accounts.position;
            apply_pending_rewards(config, position)?;

            let repayment = net_debt(position.debt).ok_or(EngineError::MathOverflow)?;
            require!(
                ctx.accounts.owner_debt_ata.amount >= repayment,
                EngineError::InsufficientDebtBalance
            );

            config.total_active_collateral = config
                .total_active_collateral
                .checked_sub(position.collateral)
                .ok_or(EngineError::MathOverflow)?;
            config.total_active_debt = config
                .total_active_debt
                .checked_sub(position.debt)
                .ok_or(EngineError::MathOverflow)?;
            config.total_stakes = config
                .total_stakes
                .checked_sub(position.stake)
                .ok_or(EngineError::MathOverflow)?;

            let collateral = position.collateral;
            position.collateral = 0;
            position.debt = 0;
            position.stake = 0;
            position.ordering_ratio = 0;
            position.status = PositionStatus::Closed;
            (collateral, repayment)
        };
        msg!("Closing position: repaying {}, returning {} collateral", repayment, collateral);

        // STEP 1: Burn the caller's net debt
        token::burn(
            CpiContext::new(
                ctx.accounts.token_program.to_account_info(),
                Burn {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    from: ctx.accounts.owner_debt_ata.to_account_info(),
                    authority: ctx.accounts.owner.to_account_info(),
                },
            ),
            repayment,
        )?;

        // STEP 2: Burn the gas reserve and return the collateral
        let authority_bump = ctx.accounts.config.authority_bump;
        let seeds = &[b"protocol_authority".as_ref(), &[authority_bump]];
        let signer_seeds = &[&seeds[..]];

        token::burn(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                Burn {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    from: ctx.accounts.gas_pool.to_account_info(),
                    authority: ctx.accounts.protocol_authority.to_account_info(),
                },
                signer_seeds,
            ),
            GAS_COMPENSATION,
        )?;
        token::transfer(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.collateral_vault.to_account_info(),
                    to: ctx.accounts.owner_collateral_ata.to_account_info(),
                    authority: ctx.accounts.protocol_authority.to_account_info(),
                },
                signer_seeds,
            ),
            collateral,
        )?;
        msg!("✅ Position closed");

        emit!(PositionUpdated {
            owner: ctx.accounts.owner.key(),
            debt: 0,
            collateral: 0,
            stake: 0,
            operation: PositionOperation::Close,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    // ========== FLASH LOAN PRIMITIVE ==========

    /// Mint a flash loan of the debt token to the registered orchestrator.
    /// The guard stays armed until `settle_flash_loan` burns principal + fee
    /// in the same transaction.
    pub fn issue_flash_loan(ctx: Context<IssueFlashLoan>, amount: u64) -> Result<()> {
        require!(!ctx.accounts.config.paused, EngineError::ProtocolPaused);
        require!(amount > 0, EngineError::ZeroLoanAmount);
        require_keys_eq!(
            ctx.accounts.borrower.key(),
            ctx.accounts.config.orchestrator_authority,
            EngineError::UnauthorizedLoanBorrower
        );
        require!(!ctx.accounts.flash_loan.active, EngineError::LoanAlreadyActive);

        let fee = (amount as u128)
            .checked_mul(ctx.accounts.config.flash_fee_bps as u128)
            .and_then(|v| v.checked_div(BPS_DENOMINATOR as u128))
            .and_then(|v| u64::try_from(v).ok())
            .ok_or(EngineError::MathOverflow)?;

        let flash_loan = &mut ctx.accounts.flash_loan;
        flash_loan.active = true;
        flash_loan.borrower = ctx.accounts.borrower.key();
        flash_loan.amount = amount;
        flash_loan.fee = fee;

        let authority_bump = ctx.accounts.config.authority_bump;
        let seeds = &[b"protocol_authority".as_ref(), &[authority_bump]];
        let signer_seeds = &[&seeds[..]];
        token::mint_to(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                MintTo {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    to: ctx.accounts.borrower_debt_ata.to_account_info(),
                    authority: ctx.accounts.protocol_authority.to_account_info(),
                },
                signer_seeds,
            ),
            amount,
        )?;
        msg!("Flash loan issued: {} (+{} fee)", amount, fee);

        let clock = Clock::get()?;
        emit!(FlashLoanIssued {
            borrower: ctx.accounts.borrower.key(),
            amount,
            fee,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    /// Burn principal + fee from the borrower and disarm the guard
    pub fn settle_flash_loan(ctx: Context<SettleFlashLoan>) -> Result<()> {
        require!(ctx.accounts.flash_loan.active, EngineError::NoActiveLoan);
        require_keys_eq!(
            ctx.accounts.borrower.key(),
            ctx.accounts.flash_loan.borrower,
            EngineError::UnauthorizedLoanBorrower
        );

        let repayment = ctx
            .accounts
            .flash_loan
            .amount
            .checked_add(ctx.accounts.flash_loan.fee)
            .ok_or(EngineError::MathOverflow)?;
        require!(
            ctx.accounts.borrower_debt_ata.amount >= repayment,
            EngineError::LoanRepaymentShortfall
        );

        token::burn(
            CpiContext::new(
                ctx.accounts.token_program.to_account_info(),
                Burn {
                    mint: ctx.accounts.debt_mint.to_account_info(),
                    from: ctx.accounts.borrower_debt_ata.to_account_info(),
                    authority: ctx.accounts.borrower.to_account_info(),
                },
            ),
            repayment,
        )?;

        let (amount, fee) = (ctx.accounts.flash_loan.amount, ctx.accounts.flash_loan.fee);
        let flash_loan = &mut ctx.accounts.flash_loan;
        flash_loan.active = false;
        flash_loan.borrower = Pubkey::default();
        flash_loan.amount = 0;
        flash_loan.fee = 0;
        msg!("Flash loan settled: {} burned", repayment);

        let clock = Clock::get()?;
        emit!(FlashLoanSettled {
            borrower: ctx.accounts.borrower.key(),
            amount,
            fee,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    // ========== CIRCUIT BREAKER ==========

    pub fn pause_protocol(ctx: Context<AdminProtocolAction>) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require_keys_eq!(ctx.accounts.admin.key(), config.admin, EngineError::Unauthorized);
        require!(!config.paused, EngineError::AlreadyPaused);

        config.paused = true;
        msg!("🛑 PROTOCOL PAUSED by admin: {}", config.admin);

        let clock = Clock::get()?;
        emit!(ProtocolPauseToggled {
            admin: config.admin,
            paused: true,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    pub fn unpause_protocol(ctx: Context<AdminProtocolAction>) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require_keys_eq!(ctx.accounts.admin.key(), config.admin, EngineError::Unauthorized);
        require!(config.paused, EngineError::NotPaused);

        config.paused = false;
        msg!("✅ PROTOCOL UNPAUSED by admin: {}", config.admin);

        let clock = Clock::get()?;
        emit!(ProtocolPauseToggled {
            admin: config.admin,
            paused: false,
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }
}

// ========== PURE ADJUSTMENT CORE ==========
// Exposed for tests and SDK reference; instruction handlers apply the
// outcomes these functions compute.

#[derive(Clone, Copy, Debug)]
pub struct AdjustmentRequest {
    pub collateral_deposit: u64,
    pub collateral_withdrawal: u64,
    pub debt_change: u64,
    pub is_debt_increase: bool,
    pub max_fee_bps: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct AdjustmentOutcome {
    pub new_collateral: u64,
    pub new_debt: u64,
    pub fee: u64,
    pub previous_ratio_bps: u64,
    pub new_ratio_bps: u64,
    pub ordering_ratio: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct OpenOutcome {
    pub composite_debt: u64,
    pub fee: u64,
    pub ratio_bps: u64,
    pub ordering_ratio: u64,
}

/// Validate and price a combined adjustment against an active position.
/// `debt_token_balance` is the repayer's balance, checked on debt decreases.
pub fn evaluate_adjustment(
    collateral: u64,
    debt: u64,
    request: &AdjustmentRequest,
    borrow_rate_bps: u64,
    price: u64,
    debt_token_balance: u64,
) -> Result<AdjustmentOutcome> {
    require!(
        request.collateral_deposit == 0 || request.collateral_withdrawal == 0,
        EngineError::BothCollateralDirections
    );
    if request.is_debt_increase {
        require!(request.debt_change > 0, EngineError::ZeroDebtIncrease);
    }
    require!(
        request.collateral_deposit > 0
            || request.collateral_withdrawal > 0
            || request.debt_change > 0,
        EngineError::ZeroAdjustment
    );

    let mut fee = 0u64;
    let new_debt = if request.is_debt_increase {
        fee = borrowing_fee(request.debt_change, borrow_rate_bps)
            .ok_or(EngineError::MathOverflow)?;
        require!(
            fee_within_cap(fee, request.debt_change, request.max_fee_bps),
            EngineError::FeeExceedsMaximum
        );
        debt.checked_add(request.debt_change)
            .and_then(|d| d.checked_add(fee))
            .ok_or(EngineError::MathOverflow)?
    } else if request.debt_change > 0 {
        let remaining = debt
            .checked_sub(request.debt_change)
            .ok_or(EngineError::BelowMinimumNetDebt)?;
        let remaining_net = net_debt(remaining).ok_or(EngineError::BelowMinimumNetDebt)?;
        require!(remaining_net >= MIN_NET_DEBT, EngineError::BelowMinimumNetDebt);
        require!(
            debt_token_balance >= request.debt_change,
            EngineError::InsufficientDebtBalance
        );
        remaining
    } else {
        debt
    };

    // A withdrawal above tracked collateral means the ledger itself is wrong
    require!(
        request.collateral_withdrawal <= collateral,
        EngineError::WithdrawalExceedsCollateral
    );
    let new_collateral = collateral
        .checked_add(request.collateral_deposit)
        .and_then(|c| c.checked_sub(request.collateral_withdrawal))
        .ok_or(EngineError::MathOverflow)?;

    let previous_ratio_bps =
        compute_collateral_ratio_bps(collateral, price, debt).ok_or(EngineError::MathOverflow)?;
    let new_ratio_bps = compute_collateral_ratio_bps(new_collateral, price, new_debt)
        .ok_or(EngineError::MathOverflow)?;
    require!(new_ratio_bps >= MCR_BPS, EngineError::BelowMinimumCollateralRatio);

    let ordering_ratio =
        compute_ordering_ratio(new_collateral, new_debt).ok_or(EngineError::MathOverflow)?;

    Ok(AdjustmentOutcome {
        new_collateral,
        new_debt,
        fee,
        previous_ratio_bps,
        new_ratio_bps,
        ordering_ratio,
    })
}

/// Validate and price an open, the degenerate adjustment with no prior state
pub fn evaluate_open(
    collateral_amount: u64,
    debt_amount: u64,
    borrow_rate_bps: u64,
    max_fee_bps: u64,
    price: u64,
) -> Result<OpenOutcome> {
    require!(collateral_amount > 0, EngineError::ZeroCollateral);
    require!(debt_amount > 0, EngineError::ZeroDebtIncrease);

    let fee = borrowing_fee(debt_amount, borrow_rate_bps).ok_or(EngineError::MathOverflow)?;
    require!(
        fee_within_cap(fee, debt_amount, max_fee_bps),
        EngineError::FeeExceedsMaximum
    );

    let requested_net = debt_amount.checked_add(fee).ok_or(EngineError::MathOverflow)?;
    require!(requested_net >= MIN_NET_DEBT, EngineError::BelowMinimumNetDebt);
    let composite = composite_debt(requested_net).ok_or(EngineError::MathOverflow)?;

    let ratio_bps = compute_collateral_ratio_bps(collateral_amount, price, composite)
        .ok_or(EngineError::MathOverflow)?;
    require!(ratio_bps >= MCR_BPS, EngineError::BelowMinimumCollateralRatio);

    let ordering_ratio =
        compute_ordering_ratio(collateral_amount, composite).ok_or(EngineError::MathOverflow)?;

    Ok(OpenOutcome {
        composite_debt: composite,
        fee,
        ratio_bps,
        ordering_ratio,
    })
}

// ========== RATIO & FEE MATH ==========

/// Price-denominated collateralization ratio in bps; u64::MAX when debt is 0
pub fn compute_collateral_ratio_bps(collateral: u64, price: u64, debt: u64) -> Option<u64> {
    if debt == 0 {
        return Some(u64::MAX);
    }
    let value = (collateral as u128)
        .checked_mul(price as u128)?
        .checked_div(COLLATERAL_SCALE)?;
    let ratio = value
        .checked_mul(BPS_DENOMINATOR as u128)?
        .checked_div(debt as u128)?;
    Some(u64::try_from(ratio).unwrap_or(u64::MAX))
}

/// Price-independent ordering ratio used to rank positions
pub fn compute_ordering_ratio(collateral: u64, debt: u64) -> Option<u64> {
    if debt == 0 {
        return Some(u64::MAX);
    }
    let ratio = (collateral as u128)
        .checked_mul(ORDERING_RATIO_PRECISION)?
        .checked_div(debt as u128)?;
    Some(u64::try_from(ratio).unwrap_or(u64::MAX))
}

/// Fixed-point exponentiation by squaring in 1e-9 precision
pub fn dec_pow(base: u128, exponent: u64) -> u128 {
    let mut n = exponent.min(MAX_DECAY_MINUTES);
    if n == 0 {
        return DECIMAL_PRECISION;
    }
    let mut x = base;
    let mut y = DECIMAL_PRECISION;
    while n > 1 {
        if n % 2 == 1 {
            y = x * y / DECIMAL_PRECISION;
        }
        x = x * x / DECIMAL_PRECISION;
        n /= 2;
    }
    x * y / DECIMAL_PRECISION
}

pub fn decayed_base_rate_bps(base_rate_bps: u64, minutes_elapsed: u64) -> u64 {
    let factor = dec_pow(MINUTE_DECAY_FACTOR, minutes_elapsed);
    ((base_rate_bps as u128) * factor / DECIMAL_PRECISION) as u64
}

/// Borrowing rate: decayed base rate plus the floor, capped
pub fn borrowing_rate_bps(base_rate_bps: u64) -> u64 {
    (BORROWING_FEE_FLOOR_BPS.saturating_add(base_rate_bps)).min(MAX_BORROWING_FEE_BPS)
}

pub fn borrowing_fee(amount: u64, rate_bps: u64) -> Option<u64> {
    (amount as u128)
        .checked_mul(rate_bps as u128)?
        .checked_div(BPS_DENOMINATOR as u128)
        .and_then(|v| u64::try_from(v).ok())
}

/// Whether a fee respects the caller's declared maximum percentage
pub fn fee_within_cap(fee: u64, amount: u64, max_fee_bps: u64) -> bool {
    let cap = (amount as u128) * (max_fee_bps as u128) / (BPS_DENOMINATOR as u128);
    (fee as u128) <= cap
}

pub fn composite_debt(requested_net_debt: u64) -> Option<u64> {
    requested_net_debt.checked_add(GAS_COMPENSATION)
}

pub fn net_debt(composite_debt: u64) -> Option<u64> {
    composite_debt.checked_sub(GAS_COMPENSATION)
}

/// Pending redistribution gain for a stake between two accumulator readings
pub fn pending_reward(stake: u64, accumulator: u128, snapshot: u128) -> Option<u64> {
    let delta = accumulator.checked_sub(snapshot)?;
    let gain = (stake as u128)
        .checked_mul(delta)?
        .checked_div(DECIMAL_PRECISION)?;
    u64::try_from(gain).ok()
}

// ========== INTERNAL HELPERS ==========

fn oracle_price(feed: &Account<price_oracle::PriceFeed>) -> Result<u64> {
    require!(feed.price > 0, EngineError::InvalidOraclePrice);
    Ok(feed.price as u64)
}

/// Decay the stored base rate to now and return the decayed value
fn decay_base_rate(config: &mut Account<ProtocolConfig>, now: i64) -> u64 {
    let elapsed = now.saturating_sub(config.last_fee_decay_ts).max(0) as u64;
    let minutes = elapsed / SECONDS_PER_MINUTE as u64;
    let decayed = decayed_base_rate_bps(config.base_rate_bps, minutes);
    if minutes > 0 {
        config.base_rate_bps = decayed;
        config.last_fee_decay_ts = now;
    }
    decayed
}

/// Fold accumulated per-stake rewards into the position and refresh its
/// snapshots. Runs before every read-modify-write of an active position.
fn apply_pending_rewards(
    config: &Account<ProtocolConfig>,
    position: &mut Account<Position>,
) -> Result<()> {
    if position.status == PositionStatus::Active && position.stake > 0 {
        let coll_gain = pending_reward(
            position.stake,
            config.coll_reward_per_stake,
            position.coll_reward_snapshot,
        )
        .ok_or(EngineError::MathOverflow)?;
        let debt_gain = pending_reward(
            position.stake,
            config.debt_reward_per_stake,
            position.debt_reward_snapshot,
        )
        .ok_or(EngineError::MathOverflow)?;
        position.collateral = position
            .collateral
            .checked_add(coll_gain)
            .ok_or(EngineError::MathOverflow)?;
        position.debt = position
            .debt
            .checked_add(debt_gain)
            .ok_or(EngineError::MathOverflow)?;
    }
    position.coll_reward_snapshot = config.coll_reward_per_stake;
    position.debt_reward_snapshot = config.debt_reward_per_stake;
    Ok(())
}

/// Stake tracks collateral; total stakes stay consistent across the update
fn update_stake(
    config: &mut Account<ProtocolConfig>,
    position: &mut Account<Position>,
) -> Result<u64> {
    let new_stake = position.collateral;
    config.total_stakes = config
        .total_stakes
        .checked_sub(position.stake)
        .and_then(|t| t.checked_add(new_stake))
        .ok_or(EngineError::MathOverflow)?;
    position.stake = new_stake;
    Ok(new_stake)
}

// ========== ACCOUNTS ==========

#[derive(Accounts)]
pub struct InitializeProtocol<'info> {
    #[account(
        init,
        payer = admin,
        space = 8 + ProtocolConfig::LEN,
        seeds = [b"protocol_config"],
        bump
    )]
    pub config: Account<'info, ProtocolConfig>,

    #[account(
        init,
        payer = admin,
        space = 8 + FlashLoan::LEN,
        seeds = [b"flash_loan"],
        bump
    )]
    pub flash_loan: Account<'info, FlashLoan>,

    pub collateral_mint: Account<'info, Mint>,

    /// Debt token; the protocol authority PDA must be its mint authority
    #[account(mint::authority = protocol_authority, mint::decimals = 6)]
    pub debt_mint: Account<'info, Mint>,

    #[account(seeds = [b"price_feed"], bump, seeds::program = price_oracle::ID)]
    pub price_feed: Account<'info, price_oracle::PriceFeed>,

    /// CHECK: PDA authority over the vault, gas pool, and debt mint
    #[account(seeds = [b"protocol_authority"], bump)]
    pub protocol_authority: UncheckedAccount<'info>,

    #[account(
        init,
        payer = admin,
        associated_token::mint = collateral_mint,
        associated_token::authority = protocol_authority
    )]
    pub collateral_vault: Account<'info, TokenAccount>,

    /// Holds the per-position gas reserve between open and close
    #[account(
        init,
        payer = admin,
        associated_token::mint = debt_mint,
        associated_token::authority = protocol_authority
    )]
    pub gas_pool: Account<'info, TokenAccount>,

    #[account(mut)]
    pub admin: Signer<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct OpenPosition<'info> {
    #[account(mut, seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    #[account(
        init_if_needed,
        payer = owner,
        space = 8 + Position::LEN,
        seeds = [b"position", owner.key().as_ref()],
        bump
    )]
    pub position: Account<'info, Position>,

    #[account(mut)]
    pub owner: Signer<'info>,

    #[account(address = config.price_feed @ EngineError::InvalidPriceFeed)]
    pub price_feed: Account<'info, price_oracle::PriceFeed>,

    #[account(address = config.collateral_mint)]
    pub collateral_mint: Account<'info, Mint>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    /// CHECK: PDA authority over the vault, gas pool, and debt mint
    #[account(seeds = [b"protocol_authority"], bump = config.authority_bump)]
    pub protocol_authority: UncheckedAccount<'info>,

    #[account(
        mut,
        associated_token::mint = collateral_mint,
        associated_token::authority = protocol_authority
    )]
    pub collateral_vault: Account<'info, TokenAccount>,

    #[account(
        mut,
        associated_token::mint = debt_mint,
        associated_token::authority = protocol_authority
    )]
    pub gas_pool: Account<'info, TokenAccount>,

    /// Caller's collateral account (source of the deposit)
    #[account(
        mut,
        constraint = owner_collateral_ata.owner == owner.key(),
        constraint = owner_collateral_ata.mint == collateral_mint.key()
    )]
    pub owner_collateral_ata: Account<'info, TokenAccount>,

    /// Caller's debt token account (receives the minted debt)
    #[account(
        init_if_needed,
        payer = owner,
        associated_token::mint = debt_mint,
        associated_token::authority = owner
    )]
    pub owner_debt_ata: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct AdjustPosition<'info> {
    #[account(mut, seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    #[account(mut, seeds = [b"position", owner.key().as_ref()], bump)]
    pub position: Account<'info, Position>,

    /// Position owner; leveraged flows carry this signature through CPI
    pub owner: Signer<'info>,

    #[account(address = config.price_feed @ EngineError::InvalidPriceFeed)]
    pub price_feed: Account<'info, price_oracle::PriceFeed>,

    #[account(address = config.collateral_mint)]
    pub collateral_mint: Account<'info, Mint>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    /// CHECK: PDA authority over the vault, gas pool, and debt mint
    #[account(seeds = [b"protocol_authority"], bump = config.authority_bump)]
    pub protocol_authority: UncheckedAccount<'info>,

    #[account(
        mut,
        associated_token::mint = collateral_mint,
        associated_token::authority = protocol_authority
    )]
    pub collateral_vault: Account<'info, TokenAccount>,

    /// Source of deposited collateral
    #[account(mut, constraint = collateral_source.mint == collateral_mint.key())]
    pub collateral_source: Account<'info, TokenAccount>,

    /// Destination for withdrawn collateral
    #[account(mut, constraint = collateral_destination.mint == collateral_mint.key())]
    pub collateral_destination: Account<'info, TokenAccount>,

    /// Source of repaid debt tokens
    #[account(mut, constraint = debt_source.mint == debt_mint.key())]
    pub debt_source: Account<'info, TokenAccount>,

    /// Destination for newly minted debt tokens
    #[account(mut, constraint = debt_destination.mint == debt_mint.key())]
    pub debt_destination: Account<'info, TokenAccount>,

    /// Authority over collateral_source and debt_source; the owner itself
    /// on direct calls, the orchestrator authority on leveraged calls
    pub funds_authority: Signer<'info>,

    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct ClosePosition<'info> {
    #[account(mut, seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    #[account(mut, seeds = [b"position", owner.key().as_ref()], bump)]
    pub position: Account<'info, Position>,

    pub owner: Signer<'info>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    /// CHECK: PDA authority over the vault, gas pool, and debt mint
    #[account(seeds = [b"protocol_authority"], bump = config.authority_bump)]
    pub protocol_authority: UncheckedAccount<'info>,

    #[account(
        mut,
        associated_token::mint = config.collateral_mint,
        associated_token::authority = protocol_authority
    )]
    pub collateral_vault: Account<'info, TokenAccount>,

    #[account(
        mut,
        associated_token::mint = debt_mint,
        associated_token::authority = protocol_authority
    )]
    pub gas_pool: Account<'info, TokenAccount>,

    /// Caller's debt account (source of the repayment burn)
    #[account(
        mut,
        constraint = owner_debt_ata.owner == owner.key(),
        constraint = owner_debt_ata.mint == debt_mint.key()
    )]
    pub owner_debt_ata: Account<'info, TokenAccount>,

    /// Caller's collateral account (receives the returned collateral)
    #[account(
        mut,
        constraint = owner_collateral_ata.owner == owner.key(),
        constraint = owner_collateral_ata.mint == config.collateral_mint
    )]
    pub owner_collateral_ata: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct IssueFlashLoan<'info> {
    #[account(seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    #[account(mut, seeds = [b"flash_loan"], bump)]
    pub flash_loan: Account<'info, FlashLoan>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    /// The registered orchestrator authority, signing via CPI
    pub borrower: Signer<'info>,

    #[account(
        mut,
        constraint = borrower_debt_ata.owner == borrower.key(),
        constraint = borrower_debt_ata.mint == debt_mint.key()
    )]
    pub borrower_debt_ata: Account<'info, TokenAccount>,

    /// CHECK: PDA authority over the vault, gas pool, and debt mint
    #[account(seeds = [b"protocol_authority"], bump = config.authority_bump)]
    pub protocol_authority: UncheckedAccount<'info>,

    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct SettleFlashLoan<'info> {
    #[account(seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    #[account(mut, seeds = [b"flash_loan"], bump)]
    pub flash_loan: Account<'info, FlashLoan>,

    #[account(mut, address = config.debt_mint)]
    pub debt_mint: Account<'info, Mint>,

    pub borrower: Signer<'info>,

    #[account(
        mut,
        constraint = borrower_debt_ata.owner == borrower.key(),
        constraint = borrower_debt_ata.mint == debt_mint.key()
    )]
    pub borrower_debt_ata: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct AdminProtocolAction<'info> {
    #[account(mut, seeds = [b"protocol_config"], bump)]
    pub config: Account<'info, ProtocolConfig>,

    pub admin: Signer<'info>,
}

// ========== STATE ==========

#[account]
pub struct ProtocolConfig {
    pub admin: Pubkey,
    pub collateral_mint: Pubkey,
    pub debt_mint: Pubkey,
    pub price_feed: Pubkey,
    /// The only identity allowed to take flash loans
    pub orchestrator_authority: Pubkey,
    pub flash_fee_bps: u64,
    /// Decaying borrowing base rate, bps
    pub base_rate_bps: u64,
    pub last_fee_decay_ts: i64,
    // Pool accounting
    pub total_active_collateral: u64,
    pub total_active_debt: u64,
    pub total_stakes: u64,
    // Redistribution accumulators, 1e-9 per-stake fixed point
    pub coll_reward_per_stake: u128,
    pub debt_reward_per_stake: u128,
    pub paused: bool,
    pub authority_bump: u8,
}

impl ProtocolConfig {
    pub const LEN: usize = 32 * 5 + 8 * 6 + 16 * 2 + 1 + 1;
}

#[account]
pub struct Position {
    pub owner: Pubkey,
    pub collateral: u64,
    pub debt: u64,
    pub stake: u64,
    pub ordering_ratio: u64,
    pub coll_reward_snapshot: u128,
    pub debt_reward_snapshot: u128,
    pub status: PositionStatus,
}

impl Position {
    pub const LEN: usize = 32 + 8 * 4 + 16 * 2 + 1;
}

/// Transient flash-loan guard; armed by issue, disarmed by settle
#[account]
pub struct FlashLoan {
    pub active: bool,
    pub borrower: Pubkey,
    pub amount: u64,
    pub fee: u64,
}

impl FlashLoan {
    pub const LEN: usize = 1 + 32 + 8 + 8;
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Nonexistent,
    Active,
    Closed,
    Liquidated,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq)]
pub enum PositionOperation {
    Open,
    Adjust,
    Close,
}

// ========== EVENTS ==========

#[event]
pub struct ProtocolInitialized {
    pub admin: Pubkey,
    pub collateral_mint: Pubkey,
    pub debt_mint: Pubkey,
    pub timestamp: i64,
}

#[event]
pub struct PositionCreated {
    pub owner: Pubkey,
    pub ordering_ratio: u64,
    pub timestamp: i64,
}

#[event]
pub struct PositionUpdated {
    pub owner: Pubkey,
    pub debt: u64,
    pub collateral: u64,
    pub stake: u64,
    pub operation: PositionOperation,
    pub timestamp: i64,
}

#[event]
pub struct BorrowingFeePaid {
    pub owner: Pubkey,
    pub fee: u64,
    pub timestamp: i64,
}

/// Re-ranking observation for the external ordering structure; the hints
/// are best-effort positioning aids
#[event]
pub struct RankingUpdated {
    pub owner: Pubkey,
    pub ordering_ratio: u64,
    pub hint_high: Pubkey,
    pub hint_low: Pubkey,
    pub timestamp: i64,
}

#[event]
pub struct FlashLoanIssued {
    pub borrower: Pubkey,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: i64,
}

#[event]
pub struct FlashLoanSettled {
    pub borrower: Pubkey,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: i64,
}

#[event]
pub struct ProtocolPauseToggled {
    pub admin: Pubkey,
    pub paused: bool,
    pub timestamp: i64,
}

// ========== ERRORS ==========

#[error_code]
pub enum EngineError {
    // Request shape
    #[msg("Collateral deposit and withdrawal cannot both be non-zero")]
    BothCollateralDirections,
    #[msg("Adjustment changes neither collateral nor debt")]
    ZeroAdjustment,
    #[msg("Debt increase must be strictly positive")]
    ZeroDebtIncrease,
    #[msg("Collateral must be non-zero")]
    ZeroCollateral,
    #[msg("Loan amount must be non-zero")]
    ZeroLoanAmount,
    #[msg("Position is not active")]
    PositionNotActive,
    #[msg("Position is already active")]
    PositionAlreadyActive,
    #[msg("Price feed does not match protocol configuration")]
    InvalidPriceFeed,
    #[msg("Flash fee above allowed maximum")]
    InvalidFlashFee,
    // Economic invariants
    #[msg("Resulting collateral ratio below minimum")]
    BelowMinimumCollateralRatio,
    #[msg("Resulting net debt below minimum")]
    BelowMinimumNetDebt,
    #[msg("Borrowing fee exceeds caller's maximum")]
    FeeExceedsMaximum,
    #[msg("Insufficient debt token balance for repayment")]
    InsufficientDebtBalance,
    #[msg("Balance does not cover loan principal plus fee")]
    LoanRepaymentShortfall,
    // Security
    #[msg("Unauthorized")]
    Unauthorized,
    #[msg("Loan borrower is not the registered orchestrator")]
    UnauthorizedLoanBorrower,
    #[msg("A flash loan is already in flight")]
    LoanAlreadyActive,
    #[msg("No flash loan is in flight")]
    NoActiveLoan,
    #[msg("Protocol is paused")]
    ProtocolPaused,
    #[msg("Protocol is already paused")]
    AlreadyPaused,
    #[msg("Protocol is not paused")]
    NotPaused,
    // Accounting defects
    #[msg("Withdrawal exceeds tracked collateral")]
    WithdrawalExceedsCollateral,
    #[msg("Oracle price is invalid")]
    InvalidOraclePrice,
    #[msg("Overflow during math operation")]
    MathOverflow,
}
