//! Wallet ledger demo binary

use prometheus::{Encoder, TextEncoder};
use std::error::Error;
use std::sync::Arc;
use std::thread;
use wallet_ledger::{BatchOperation, Config, Holder, Ledger, LedgerEvent, NewWallet, Outcome};

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting wallet ledger demo");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let ledger = Ledger::builder()
        .config(config)
        .listener(Arc::new(|event: &LedgerEvent| {
            tracing::info!(event = ?event.kind(), "Event delivered");
        }))
        .build()?;

    let alice = ledger.create_wallet(NewWallet::new(Holder::new("user", "alice")))?;
    let bob = ledger.create_wallet(
        NewWallet::new(Holder::new("user", "bob"))
            .name("USD Savings")
            .decimal_places(2),
    )?;

    // Plain deposit and withdrawal
    ledger.deposit(&alice, "1000", None)?;
    ledger.withdraw(&alice, "250", None)?;
    tracing::info!(balance = %ledger.balance(&alice)?, "Alice after deposit/withdraw");

    // Rejected withdrawal
    if let Err(err) = ledger.withdraw(&bob, "1", None) {
        tracing::info!(error = %err, "Bob cannot withdraw from an empty wallet");
    }

    // Transfer with fee
    let transfer = ledger.transfer(&alice, &bob, "500", "20", None)?;
    tracing::info!(
        transfer = %transfer.uuid,
        alice = %ledger.balance(&alice)?,
        bob = %ledger.balance(&bob)?,
        "Transfer done"
    );

    // Rolled-back host transaction leaves nothing behind
    ledger.transaction_with(|| {
        ledger.deposit(&bob, "9999", None)?;
        Ok(Outcome::Rollback(()))
    })?;
    tracing::info!(bob = %ledger.balance(&bob)?, "After rolled-back deposit");

    // Freeze part of a balance
    ledger.freeze(&bob, Some("100"))?;
    tracing::info!(
        available = %ledger.available_balance(&bob)?,
        frozen = %ledger.frozen_amount(&bob)?,
        "Bob froze funds"
    );

    // Batch: the deposit covers the withdrawal of the same batch
    ledger.apply(vec![
        BatchOperation::deposit(&alice, "300"),
        BatchOperation::withdraw(&alice, "400"),
    ])?;
    tracing::info!(alice = %ledger.balance(&alice)?, "Batch applied");

    // Concurrent deposits from several contexts
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let ledger = ledger.clone();
            let wallet = alice.clone();
            thread::spawn(move || -> wallet_ledger::Result<()> {
                for _ in 0..25 {
                    ledger.deposit(&wallet, "1", None)?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker
            .join()
            .map_err(|_| "deposit worker panicked")??;
    }
    tracing::info!(
        alice = %ledger.balance(&alice)?,
        count = ledger.transaction_count(&alice)?,
        "Concurrent deposits done"
    );

    ledger.verify_wallet(&alice)?;
    ledger.verify_wallet(&bob)?;
    ledger.verify_transfer(&transfer.uuid)?;
    tracing::info!("Checksums verified");

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&ledger.metrics().registry().gather(), &mut buffer)?;
    println!("{}", String::from_utf8(buffer)?);

    tracing::info!("Shutting down wallet ledger demo");
    Ok(())
}
