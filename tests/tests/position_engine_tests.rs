use anchor_lang::prelude::{AccountDeserialize, AccountSerialize, Pubkey};
use anchor_lang::InstructionData;
use anchor_lang::ToAccountMetas;
use anchor_spl::associated_token::get_associated_token_address;
use anchor_spl::token::spl_token;
use anchor_spl::token::spl_token::state::{Account as SplTokenAccount, Mint as SplMint};
use position_engine::{EngineError, Position, PositionStatus, GAS_COMPENSATION};
use solana_program::account_info::AccountInfo;
use solana_program::entrypoint::ProgramResult;
use solana_program_option::COption;
use solana_program_pack::Pack;
use solana_program_test::{BanksClientError, ProgramTest, ProgramTestContext};
use solana_sdk::account::Account;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{Instruction, InstructionError};
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_instruction;
use solana_sdk::system_program;
use solana_sdk::transaction::{Transaction, TransactionError};

const FIXTURE_LAMPORTS: u64 = 10_000_000;

/// 200 debt units (6 dp) per whole collateral token
const PRICE: i64 = 200_000_000;
const USER_COLLATERAL: u64 = 100_000_000_000; // 100 tokens
const FEE_BUDGET: u64 = 100_000_000; // pre-seeded debt tokens to cover fees

fn serialize_anchor_account<T: AccountSerialize>(data: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    data.try_serialize(&mut buf).expect("serialize account");
    buf
}

fn token_account_data(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
    let token_account = SplTokenAccount {
        mint,
        owner,
        amount,
        delegate: COption::None,
        state: spl_token::state::AccountState::Initialized,
        is_native: COption::None,
        delegated_amount: 0,
        close_authority: COption::None,
    };
    let mut data = vec![0u8; SplTokenAccount::LEN];
    SplTokenAccount::pack(token_account, &mut data).expect("pack token account");
    data
}

fn mint_data(mint_authority: Pubkey, decimals: u8, supply: u64) -> Vec<u8> {
    let mint = SplMint {
        mint_authority: COption::Some(mint_authority),
        supply,
        decimals,
        is_initialized: true,
        freeze_authority: COption::None,
    };
    let mut data = vec![0u8; SplMint::LEN];
    SplMint::pack(mint, &mut data).expect("pack mint");
    data
}

fn position_engine_processor<'a, 'b, 'c, 'd>(
    program_id: &'a Pubkey,
    accounts: &'b [AccountInfo<'c>],
    data: &'d [u8],
) -> ProgramResult {
    let accounts: &[AccountInfo<'_>] = unsafe { std::mem::transmute(accounts) };
    position_engine::entry(program_id, accounts, data)
}

struct Env {
    user: Keypair,
    collateral_mint: Pubkey,
    debt_mint: Pubkey,
    price_feed: Pubkey,
    config_pda: Pubkey,
    flash_loan_pda: Pubkey,
    authority_pda: Pubkey,
    collateral_vault: Pubkey,
    gas_pool: Pubkey,
    position_pda: Pubkey,
    user_collateral_ata: Pubkey,
    user_debt_ata: Pubkey,
    orchestrator_authority: Pubkey,
}

fn build_env() -> (ProgramTest, Env) {
    let mut program_test = ProgramTest::new(
        "position_engine",
        position_engine::id(),
        solana_program_test::processor!(position_engine_processor),
    );

    let user = Keypair::new();
    let collateral_mint = Pubkey::new_unique();
    let debt_mint = Pubkey::new_unique();

    let (config_pda, _) =
        Pubkey::find_program_address(&[b"protocol_config"], &position_engine::id());
    let (flash_loan_pda, _) =
        Pubkey::find_program_address(&[b"flash_loan"], &position_engine::id());
    let (authority_pda, _) =
        Pubkey::find_program_address(&[b"protocol_authority"], &position_engine::id());
    let (position_pda, _) = Pubkey::find_program_address(
        &[b"position", user.pubkey().as_ref()],
        &position_engine::id(),
    );
    let (price_feed, _) = Pubkey::find_program_address(&[b"price_feed"], &price_oracle::id());

    let env = Env {
        collateral_vault: get_associated_token_address(&authority_pda, &collateral_mint),
        gas_pool: get_associated_token_address(&authority_pda, &debt_mint),
        user_collateral_ata: get_associated_token_address(&user.pubkey(), &collateral_mint),
        user_debt_ata: get_associated_token_address(&user.pubkey(), &debt_mint),
        orchestrator_authority: Pubkey::new_unique(),
        user,
        collateral_mint,
        debt_mint,
        price_feed,
        config_pda,
        flash_loan_pda,
        authority_pda,
        position_pda,
    };

    let feed = price_oracle::PriceFeed {
        authority: Pubkey::new_unique(),
        price: PRICE,
        smoothed_price: PRICE,
        last_update_slot: 0,
        paused: false,
    };
    program_test.add_account(
        env.price_feed,
        Account {
            lamports: FIXTURE_LAMPORTS,
            data: serialize_anchor_account(&feed),
            owner: price_oracle::id(),
            executable: false,
            rent_epoch: 0,
        },
    );
    program_test.add_account(
        env.collateral_mint,
        Account {
            lamports: FIXTURE_LAMPORTS,
            data: mint_data(Pubkey::new_unique(), 9, 1_000_000_000_000_000),
            owner: spl_token::id(),
            executable: false,
            rent_epoch: 0,
        },
    );
    // The protocol authority PDA must control the debt mint; supply covers
    // the pre-seeded fee budget
    program_test.add_account(
        env.debt_mint,
        Account {
            lamports: FIXTURE_LAMPORTS,
            data: mint_data(env.authority_pda, 6, FEE_BUDGET),
            executable: false,
            owner: spl_token::id(),
            rent_epoch: 0,
        },
    );
    program_test.add_account(
        env.user_collateral_ata,
        Account {
            lamports: FIXTURE_LAMPORTS,
            data: token_account_data(env.collateral_mint, env.user.pubkey(), USER_COLLATERAL),
            owner: spl_token::id(),
            executable: false,
            rent_epoch: 0,
        },
    );
    program_test.add_account(
        env.user_debt_ata,
        Account {
            lamports: FIXTURE_LAMPORTS,
            data: token_account_data(env.debt_mint, env.user.pubkey(), FEE_BUDGET),
            owner: spl_token::id(),
            executable: false,
            rent_epoch: 0,
        },
    );

    (program_test, env)
}

fn initialize_ix(env: &Env, admin: Pubkey) -> Instruction {
    Instruction {
        program_id: position_engine::id(),
        accounts: position_engine::accounts::InitializeProtocol {
            config: env.config_pda,
            flash_loan: env.flash_loan_pda,
            collateral_mint: env.collateral_mint,
            debt_mint: env.debt_mint,
            price_feed: env.price_feed,
            protocol_authority: env.authority_pda,
            collateral_vault: env.collateral_vault,
            gas_pool: env.gas_pool,
            admin,
            token_program: spl_token::id(),
            associated_token_program: anchor_spl::associated_token::ID,
            system_program: system_program::id(),
        }
        .to_account_metas(None),
        data: position_engine::instruction::InitializeProtocol {
            orchestrator_authority: env.orchestrator_authority,
            flash_fee_bps: 0,
        }
        .data(),
    }
}

fn open_ix(env: &Env, collateral_amount: u64, debt_amount: u64, max_fee_bps: u64) -> Instruction {
    Instruction {
        program_id: position_engine::id(),
        accounts: position_engine::accounts::OpenPosition {
            config: env.config_pda,
            position: env.position_pda,
            owner: env.user.pubkey(),
            price_feed: env.price_feed,
            collateral_mint: env.collateral_mint,
            debt_mint: env.debt_mint,
            protocol_authority: env.authority_pda,
            collateral_vault: env.collateral_vault,
            gas_pool: env.gas_pool,
            owner_collateral_ata: env.user_collateral_ata,
            owner_debt_ata: env.user_debt_ata,
            token_program: spl_token::id(),
            associated_token_program: anchor_spl::associated_token::ID,
            system_program: system_program::id(),
        }
        .to_account_metas(None),
        data: position_engine::instruction::OpenPosition {
            collateral_amount,
            debt_amount,
            max_fee_bps,
            hint_high: Pubkey::default(),
            hint_low: Pubkey::default(),
        }
        .data(),
    }
}

fn adjust_ix(
    env: &Env,
    collateral_deposit: u64,
    collateral_withdrawal: u64,
    debt_change: u64,
    is_debt_increase: bool,
    max_fee_bps: u64,
) -> Instruction {
    Instruction {
        program_id: position_engine::id(),
        accounts: position_engine::accounts::AdjustPosition {
            config: env.config_pda,
            position: env.position_pda,
            owner: env.user.pubkey(),
            price_feed: env.price_feed,
            collateral_mint: env.collateral_mint,
            debt_mint: env.debt_mint,
            protocol_authority: env.authority_pda,
            collateral_vault: env.collateral_vault,
            collateral_source: env.user_collateral_ata,
            collateral_destination: env.user_collateral_ata,
            debt_source: env.user_debt_ata,
            debt_destination: env.user_debt_ata,
            funds_authority: env.user.pubkey(),
            token_program: spl_token::id(),
        }
        .to_account_metas(None),
        data: position_engine::instruction::AdjustPosition {
            collateral_deposit,
            collateral_withdrawal,
            debt_change,
            is_debt_increase,
            max_fee_bps,
            hint_high: Pubkey::default(),
            hint_low: Pubkey::default(),
        }
        .data(),
    }
}

fn close_ix(env: &Env) -> Instruction {
    Instruction {
        program_id: position_engine::id(),
        accounts: position_engine::accounts::ClosePosition {
            config: env.config_pda,
            position: env.position_pda,
            owner: env.user.pubkey(),
            debt_mint: env.debt_mint,
            protocol_authority: env.authority_pda,
            collateral_vault: env.collateral_vault,
            gas_pool: env.gas_pool,
            owner_debt_ata: env.user_debt_ata,
            owner_collateral_ata: env.user_collateral_ata,
            token_program: spl_token::id(),
        }
        .to_account_metas(None),
        data: position_engine::instruction::ClosePosition {}.data(),
    }
}

async fn send(
    context: &mut ProgramTestContext,
    instructions: &[Instruction],
    signers: &[&Keypair],
) -> Result<(), BanksClientError> {
    let blockhash = context.banks_client.get_latest_blockhash().await?;
    let mut ixs = vec![ComputeBudgetInstruction::set_compute_unit_limit(1_400_000)];
    ixs.extend_from_slice(instructions);
    let mut all_signers: Vec<&Keypair> = vec![&context.payer];
    all_signers.extend_from_slice(signers);
    let tx = Transaction::new_signed_with_payer(
        &ixs,
        Some(&context.payer.pubkey()),
        &all_signers,
        blockhash,
    );
    context.banks_client.process_transaction(tx).await
}

async fn fund(context: &mut ProgramTestContext, to: Pubkey, lamports: u64) {
    let ix = system_instruction::transfer(&context.payer.pubkey(), &to, lamports);
    let blockhash = context.banks_client.get_latest_blockhash().await.unwrap();
    let tx = Transaction::new_signed_with_payer(
        &[ix],
        Some(&context.payer.pubkey()),
        &[&context.payer],
        blockhash,
    );
    context.banks_client.process_transaction(tx).await.unwrap();
}

async fn token_balance(context: &mut ProgramTestContext, address: Pubkey) -> u64 {
    let account = context
        .banks_client
        .get_account(address)
        .await
        .unwrap()
        .expect("token account missing");
    SplTokenAccount::unpack(&account.data).unwrap().amount
}

async fn read_position(context: &mut ProgramTestContext, address: Pubkey) -> Position {
    let account = context
        .banks_client
        .get_account(address)
        .await
        .unwrap()
        .expect("position missing");
    Position::try_deserialize(&mut account.data.as_slice()).unwrap()
}

fn assert_custom_error(err: BanksClientError, expected: EngineError) {
    let expected = u32::from(expected);
    match err {
        BanksClientError::TransactionError(TransactionError::InstructionError(
            _,
            InstructionError::Custom(code),
        )) => {
            assert_eq!(code, expected, "unexpected error code");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_open_adjust_close_round_trip() {
    let (program_test, env) = build_env();
    let mut context = program_test.start_with_context().await;
    fund(&mut context, env.user.pubkey(), 1_000_000_000).await;

    let admin = context.payer.pubkey();
    send(&mut context, &[initialize_ix(&env, admin)], &[])
        .await
        .expect("initialize");

    // Open: 30 collateral against 2000 requested debt
    let collateral = 30_000_000_000u64;
    let requested = 2_000_000_000u64;
    send(&mut context, &[open_ix(&env, collateral, requested, 100)], &[&env.user])
        .await
        .expect("open");

    let fee = 10_000_000u64; // 0.5% floor on the requested amount
    let position = read_position(&mut context, env.position_pda).await;
    assert!(position.status == PositionStatus::Active);
    assert_eq!(position.collateral, collateral);
    assert_eq!(position.debt, requested + fee + GAS_COMPENSATION);
    assert_eq!(position.stake, collateral);

    assert_eq!(token_balance(&mut context, env.collateral_vault).await, collateral);
    assert_eq!(token_balance(&mut context, env.gas_pool).await, GAS_COMPENSATION);
    assert_eq!(
        token_balance(&mut context, env.user_debt_ata).await,
        FEE_BUDGET + requested
    );

    // Withdraw part of the collateral while staying above the MCR
    send(&mut context, &[adjust_ix(&env, 0, 5_000_000_000, 0, false, 0)], &[&env.user])
        .await
        .expect("adjust");
    let position = read_position(&mut context, env.position_pda).await;
    assert_eq!(position.collateral, collateral - 5_000_000_000);

    // Close: burns requested + fee from the caller, returns all collateral
    send(&mut context, &[close_ix(&env)], &[&env.user])
        .await
        .expect("close");

    let position = read_position(&mut context, env.position_pda).await;
    assert!(position.status == PositionStatus::Closed);
    assert_eq!(position.collateral, 0);
    assert_eq!(position.debt, 0);
    assert_eq!(position.stake, 0);

    // The caller's collateral is back in full; debt cost exactly fee
    assert_eq!(
        token_balance(&mut context, env.user_collateral_ata).await,
        USER_COLLATERAL
    );
    assert_eq!(
        token_balance(&mut context, env.user_debt_ata).await,
        FEE_BUDGET - fee
    );
    assert_eq!(token_balance(&mut context, env.collateral_vault).await, 0);
    assert_eq!(token_balance(&mut context, env.gas_pool).await, 0);
}

#[tokio::test]
async fn test_open_below_mcr_rejected() {
    let (program_test, env) = build_env();
    let mut context = program_test.start_with_context().await;
    fund(&mut context, env.user.pubkey(), 1_000_000_000).await;

    let admin = context.payer.pubkey();
    send(&mut context, &[initialize_ix(&env, admin)], &[])
        .await
        .expect("initialize");

    // 10 collateral = 2000 value cannot back ~2210 composite debt at 110%
    let err = send(
        &mut context,
        &[open_ix(&env, 10_000_000_000, 2_000_000_000, 100)],
        &[&env.user],
    )
    .await
    .expect_err("open below MCR should fail");
    assert_custom_error(err, EngineError::BelowMinimumCollateralRatio);

    // No state change: vault untouched, position never created
    assert_eq!(token_balance(&mut context, env.collateral_vault).await, 0);
    let account = context
        .banks_client
        .get_account(env.position_pda)
        .await
        .unwrap();
    assert!(account.is_none(), "position should not exist");
}

#[tokio::test]
async fn test_adjust_with_both_collateral_directions_rejected() {
    let (program_test, env) = build_env();
    let mut context = program_test.start_with_context().await;
    fund(&mut context, env.user.pubkey(), 1_000_000_000).await;

    let admin = context.payer.pubkey();
    send(&mut context, &[initialize_ix(&env, admin)], &[])
        .await
        .expect("initialize");
    send(
        &mut context,
        &[open_ix(&env, 30_000_000_000, 2_000_000_000, 100)],
        &[&env.user],
    )
    .await
    .expect("open");

    let err = send(
        &mut context,
        &[adjust_ix(&env, 1_000_000_000, 1_000_000_000, 0, false, 0)],
        &[&env.user],
    )
    .await
    .expect_err("deposit and withdrawal together must fail");
    assert_custom_error(err, EngineError::BothCollateralDirections);
}

#[tokio::test]
async fn test_noop_adjust_rejected() {
    let (program_test, env) = build_env();
    let mut context = program_test.start_with_context().await;
    fund(&mut context, env.user.pubkey(), 1_000_000_000).await;

    let admin = context.payer.pubkey();
    send(&mut context, &[initialize_ix(&env, admin)], &[])
        .await
        .expect("initialize");
    send(
        &mut context,
        &[open_ix(&env, 30_000_000_000, 2_000_000_000, 100)],
        &[&env.user],
    )
    .await
    .expect("open");

    let err = send(&mut context, &[adjust_ix(&env, 0, 0, 0, false, 0)], &[&env.user])
        .await
        .expect_err("no-op adjust must fail");
    assert_custom_error(err, EngineError::ZeroAdjustment);
}

#[tokio::test]
async fn test_flash_loan_from_unregistered_borrower_rejected() {
    let (program_test, env) = build_env();
    let mut context = program_test.start_with_context().await;

    let admin = context.payer.pubkey();
    send(&mut context, &[initialize_ix(&env, admin)], &[])
        .await
        .expect("initialize");

    // An arbitrary signer with its own debt account is not the registered
    // orchestrator authority
    let intruder = Keypair::new();
    fund(&mut context, intruder.pubkey(), 1_000_000_000).await;
    let intruder_ata = get_associated_token_address(&intruder.pubkey(), &env.debt_mint);
    let create_ata =
        anchor_spl::associated_token::spl_associated_token_account::instruction::create_associated_token_account(
            &context.payer.pubkey(),
            &intruder.pubkey(),
            &env.debt_mint,
            &spl_token::id(),
        );
    send(&mut context, &[create_ata], &[]).await.expect("create ata");

    let ix = Instruction {
        program_id: position_engine::id(),
        accounts: position_engine::accounts::IssueFlashLoan {
            config: env.config_pda,
            flash_loan: env.flash_loan_pda,
            debt_mint: env.debt_mint,
            borrower: intruder.pubkey(),
            borrower_debt_ata: intruder_ata,
            protocol_authority: env.authority_pda,
            token_program: spl_token::id(),
        }
        .to_account_metas(None),
        data: position_engine::instruction::IssueFlashLoan { amount: 1_000_000 }.data(),
    };
    let err = send(&mut context, &[ix], &[&intruder])
        .await
        .expect_err("unregistered borrower must fail");
    assert_custom_error(err, EngineError::UnauthorizedLoanBorrower);
}
