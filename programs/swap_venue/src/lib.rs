use anchor_lang::prelude::*;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{self, Mint, Token, TokenAccount, Transfer};

declare_id!("Swap111111111111111111111111111111111111111");

pub const BPS_DENOMINATOR: u64 = 10_000;
/// Swap fee is capped to keep the venue usable for repayment legs
pub const MAX_SWAP_FEE_BPS: u64 = 1_000;
/// Base (collateral) side uses 9 decimals
pub const BASE_SCALE: u128 = 1_000_000_000;

#[program]
pub mod swap_venue {
    use super::*;

    /// Create the venue pool and its two vaults at a posted fixed rate
    pub fn initialize_pool(ctx: Context<InitializePool>, price: u64, fee_bps: u64) -> Result<()> {
        require!(price > 0, VenueError::InvalidPrice);
        require!(fee_bps <= MAX_SWAP_FEE_BPS, VenueError::InvalidFee);

        let pool = &mut ctx.accounts.pool;
        pool.admin = ctx.accounts.admin.key();
        pool.base_mint = ctx.accounts.base_mint.key();
        pool.quote_mint = ctx.accounts.quote_mint.key();
        pool.price = price;
        pool.fee_bps = fee_bps;
        pool.bump = ctx.bumps.pool;
        msg!("✅ Swap pool initialized: price {} quote per base, fee {} bps", price, fee_bps);
        Ok(())
    }

    pub fn set_price(ctx: Context<AdminPoolAction>, price: u64) -> Result<()> {
        let pool = &mut ctx.accounts.pool;
        pool.assert_admin(ctx.accounts.admin.key())?;
        require!(price > 0, VenueError::InvalidPrice);
        pool.price = price;
        msg!("Swap pool price set to {}", price);
        Ok(())
    }

    /// Swap `amount_in` of the source side for the other side at the posted
    /// rate, rejecting any output below `min_amount_out`. The payload is an
    /// opaque routing hint and does not affect pricing here.
    pub fn swap(
        ctx: Context<Swap>,
        amount_in: u64,
        min_amount_out: u64,
        venue_payload: Vec<u8>,
    ) -> Result<()> {
        let pool = &ctx.accounts.pool;
        require!(amount_in > 0, VenueError::ZeroAmount);

        let base_to_quote = ctx.accounts.user_source.mint == pool.base_mint;
        if base_to_quote {
            require_keys_eq!(ctx.accounts.vault_in.mint, pool.base_mint, VenueError::VaultMismatch);
            require_keys_eq!(ctx.accounts.vault_out.mint, pool.quote_mint, VenueError::VaultMismatch);
        } else {
            require_keys_eq!(ctx.accounts.user_source.mint, pool.quote_mint, VenueError::VaultMismatch);
            require_keys_eq!(ctx.accounts.vault_in.mint, pool.quote_mint, VenueError::VaultMismatch);
            require_keys_eq!(ctx.accounts.vault_out.mint, pool.base_mint, VenueError::VaultMismatch);
        }

        let amount_out = pool.quote_swap(amount_in, base_to_quote)?;
        require!(amount_out > 0, VenueError::ZeroSwapOutput);
        require!(amount_out >= min_amount_out, VenueError::SlippageExceeded);
        require!(
            ctx.accounts.vault_out.amount >= amount_out,
            VenueError::InsufficientLiquidity
        );

        // STEP 1: Pull the input side from the caller
        token::transfer(
            CpiContext::new(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.user_source.to_account_info(),
                    to: ctx.accounts.vault_in.to_account_info(),
                    authority: ctx.accounts.user_authority.to_account_info(),
                },
            ),
            amount_in,
        )?;

        // STEP 2: Pay the output side from the pool vault
        let seeds = &[b"swap_pool".as_ref(), &[pool.bump]];
        let signer_seeds = &[&seeds[..]];
        token::transfer(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.vault_out.to_account_info(),
                    to: ctx.accounts.user_destination.to_account_info(),
                    authority: ctx.accounts.pool.to_account_info(),
                },
                signer_seeds,
            ),
            amount_out,
        )?;

        msg!(
            "Swap executed: {} in -> {} out ({} payload bytes)",
            amount_in,
            amount_out,
            venue_payload.len()
        );

        let clock = Clock::get()?;
        emit!(SwapExecuted {
            user: ctx.accounts.user_authority.key(),
            base_to_quote,
            amount_in,
            amount_out,
            timestamp: clock.unix_timestamp,
        });

        Ok(())
    }
}

#[derive(Accounts)]
pub struct InitializePool<'info> {
    #[account(
        init,
        payer = admin,
        space = 8 + SwapPool::LEN,
        seeds = [b"swap_pool"],
        bump
    )]
    pub pool: Account<'info, SwapPool>,

    pub base_mint: Account<'info, Mint>,
    pub quote_mint: Account<'info, Mint>,

    /// Pool vault for the base (collateral) side
    #[account(
        init,
        payer = admin,
        associated_token::mint = base_mint,
        associated_token::authority = pool
    )]
    pub base_vault: Account<'info, TokenAccount>,

    /// Pool vault for the quote (debt) side
    #[account(
        init,
        payer = admin,
        associated_token::mint = quote_mint,
        associated_token::authority = pool
    )]
    pub quote_vault: Account<'info, TokenAccount>,

    #[account(mut)]
    pub admin: Signer<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct AdminPoolAction<'info> {
    #[account(mut, seeds = [b"swap_pool"], bump = pool.bump)]
    pub pool: Account<'info, SwapPool>,
    pub admin: Signer<'info>,
}

#[derive(Accounts)]
pub struct Swap<'info> {
    #[account(seeds = [b"swap_pool"], bump = pool.bump)]
    pub pool: Account<'info, SwapPool>,

    /// Caller's source token account
    #[account(mut)]
    pub user_source: Account<'info, TokenAccount>,

    /// Caller's destination token account
    #[account(mut)]
    pub user_destination: Account<'info, TokenAccount>,

    /// Pool vault receiving the input side
    #[account(
        mut,
        constraint = vault_in.owner == pool.key() @ VenueError::VaultMismatch
    )]
    pub vault_in: Account<'info, TokenAccount>,

    /// Pool vault paying the output side
    #[account(
        mut,
        constraint = vault_out.owner == pool.key() @ VenueError::VaultMismatch
    )]
    pub vault_out: Account<'info, TokenAccount>,

    pub user_authority: Signer<'info>,

    pub token_program: Program<'info, Token>,
}

#[account]
pub struct SwapPool {
    pub admin: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    /// Quote units (6 dp) per whole base token
    pub price: u64,
    pub fee_bps: u64,
    pub bump: u8,
}

impl SwapPool {
    pub const LEN: usize = 32 * 3 + 8 * 2 + 1;

    pub fn assert_admin(&self, admin: Pubkey) -> Result<()> {
        require_keys_eq!(admin, self.admin, VenueError::Unauthorized);
        Ok(())
    }

    /// Output amount for a swap at the posted rate, fee taken on the output
    pub fn quote_swap(&self, amount_in: u64, base_to_quote: bool) -> Result<u64> {
        let gross = if base_to_quote {
            (amount_in as u128)
                .checked_mul(self.price as u128)
                .and_then(|v| v.checked_div(BASE_SCALE))
                .ok_or(VenueError::MathOverflow)?
        } else {
            (amount_in as u128)
                .checked_mul(BASE_SCALE)
                .and_then(|v| v.checked_div(self.price as u128))
                .ok_or(VenueError::MathOverflow)?
        };
        let net = gross
            .checked_mul((BPS_DENOMINATOR - self.fee_bps) as u128)
            .and_then(|v| v.checked_div(BPS_DENOMINATOR as u128))
            .ok_or(VenueError::MathOverflow)?;
        u64::try_from(net).map_err(|_| VenueError::MathOverflow.into())
    }
}

#[event]
pub struct SwapExecuted {
    pub user: Pubkey,
    pub base_to_quote: bool,
    pub amount_in: u64,
    pub amount_out: u64,
    pub timestamp: i64,
}

#[error_code]
pub enum VenueError {
    #[msg("Zero amount not allowed")]
    ZeroAmount,
    #[msg("Invalid price")]
    InvalidPrice,
    #[msg("Invalid fee")]
    InvalidFee,
    #[msg("Swap output below minimum")]
    SlippageExceeded,
    #[msg("Swap output is zero")]
    ZeroSwapOutput,
    #[msg("Insufficient pool liquidity")]
    InsufficientLiquidity,
    #[msg("Vault does not match pool side")]
    VaultMismatch,
    #[msg("Math overflow")]
    MathOverflow,
    #[msg("Unauthorized")]
    Unauthorized,
}
