use anchor_lang::prelude::*;
use fixed::types::I80F48;

declare_id!("Feed111111111111111111111111111111111111111");

/// Smoothing weight for pushed prices: new = (3 * old + push) / 4
pub const SMOOTHING_WEIGHT: u64 = 3;

#[program]
pub mod price_oracle {
    use super::*;

    /// Initialize the global price feed with a push authority
    pub fn initialize_feed(ctx: Context<InitializeFeed>, initial_price: i64) -> Result<()> {
        require!(initial_price > 0, OracleError::InvalidPrice);

        let feed = &mut ctx.accounts.feed;
        feed.authority = ctx.accounts.authority.key();
        feed.price = initial_price;
        feed.smoothed_price = initial_price;
        feed.last_update_slot = Clock::get()?.slot;
        feed.paused = false;
        msg!("✅ Price feed initialized at {} by {}", initial_price, feed.authority);

        let clock = Clock::get()?;
        emit!(FeedInitialized {
            authority: feed.authority,
            price: initial_price,
            timestamp: clock.unix_timestamp,
        });

        Ok(())
    }

    pub fn push_price(ctx: Context<FeedCtx>, price: i64) -> Result<()> {
        let feed = &mut ctx.accounts.feed;

        require!(!feed.paused, OracleError::FeedPaused);
        require_keys_eq!(feed.authority, ctx.accounts.authority.key(), OracleError::Unauthorized);
        require!(price > 0, OracleError::InvalidPrice);

        let max_price = i64::MAX.checked_div(10_000).ok_or(OracleError::MathOverflow)?;
        require!(price < max_price, OracleError::PriceOutOfBounds);

        // Exponentially smoothed reference price alongside the raw push
        let old = I80F48::from_num(feed.smoothed_price);
        let new = I80F48::from_num(price);
        let weight = I80F48::from_num(SMOOTHING_WEIGHT);
        let smoothed = (old * weight + new) / (weight + I80F48::from_num(1));

        let clock = Clock::get()?;
        feed.price = price;
        feed.smoothed_price = smoothed.to_num();
        feed.last_update_slot = clock.slot;

        emit!(PriceUpdated {
            price,
            smoothed_price: feed.smoothed_price,
            slot: clock.slot,
            timestamp: clock.unix_timestamp,
        });

        Ok(())
    }

    pub fn validate_freshness(ctx: Context<FeedCtx>, max_staleness_slots: u64) -> Result<()> {
        let feed = &ctx.accounts.feed;
        let clock = Clock::get()?;

        require!(
            clock.slot.saturating_sub(feed.last_update_slot) <= max_staleness_slots,
            OracleError::StalePrice
        );
        require!(feed.price > 0, OracleError::InvalidPrice);
        Ok(())
    }

    pub fn pause_feed(ctx: Context<FeedCtx>) -> Result<()> {
        let feed = &mut ctx.accounts.feed;
        require_keys_eq!(feed.authority, ctx.accounts.authority.key(), OracleError::Unauthorized);
        require!(!feed.paused, OracleError::AlreadyPaused);

        feed.paused = true;
        msg!("🛑 Price feed paused by {}", ctx.accounts.authority.key());

        let clock = Clock::get()?;
        emit!(FeedPaused {
            authority: ctx.accounts.authority.key(),
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }

    pub fn unpause_feed(ctx: Context<FeedCtx>) -> Result<()> {
        let feed = &mut ctx.accounts.feed;
        require_keys_eq!(feed.authority, ctx.accounts.authority.key(), OracleError::Unauthorized);
        require!(feed.paused, OracleError::NotPaused);

        feed.paused = false;
        msg!("✅ Price feed unpaused by {}", ctx.accounts.authority.key());

        let clock = Clock::get()?;
        emit!(FeedUnpaused {
            authority: ctx.accounts.authority.key(),
            timestamp: clock.unix_timestamp,
        });
        Ok(())
    }
}

#[derive(Accounts)]
pub struct InitializeFeed<'info> {
    #[account(
        init,
        payer = authority,
        space = 8 + PriceFeed::LEN,
        seeds = [b"price_feed"],
        bump
    )]
    pub feed: Account<'info, PriceFeed>,
    #[account(mut)]
    pub authority: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct FeedCtx<'info> {
    #[account(mut, seeds = [b"price_feed"], bump)]
    pub feed: Account<'info, PriceFeed>,
    pub authority: Signer<'info>,
}

#[account]
pub struct PriceFeed {
    pub authority: Pubkey,
    /// Debt units (6 dp) per whole collateral token, as last pushed
    pub price: i64,
    pub smoothed_price: i64,
    pub last_update_slot: u64,
    pub paused: bool,
}

impl PriceFeed {
    pub const LEN: usize = 32 + 8 + 8 + 8 + 1;
}

#[event]
pub struct FeedInitialized {
    pub authority: Pubkey,
    pub price: i64,
    pub timestamp: i64,
}

#[event]
pub struct PriceUpdated {
    pub price: i64,
    pub smoothed_price: i64,
    pub slot: u64,
    pub timestamp: i64,
}

#[event]
pub struct FeedPaused {
    pub authority: Pubkey,
    pub timestamp: i64,
}

#[event]
pub struct FeedUnpaused {
    pub authority: Pubkey,
    pub timestamp: i64,
}

#[error_code]
pub enum OracleError {
    #[msg("Unauthorized price push")]
    Unauthorized,
    #[msg("Invalid price value")]
    InvalidPrice,
    #[msg("Price out of bounds")]
    PriceOutOfBounds,
    #[msg("Price is stale")]
    StalePrice,
    #[msg("Math overflow in oracle calculation")]
    MathOverflow,
    #[msg("Price feed is paused")]
    FeedPaused,
    #[msg("Price feed is already paused")]
    AlreadyPaused,
    #[msg("Price feed is not paused")]
    NotPaused,
}
