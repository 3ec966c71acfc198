//! Ledger operation benchmarks
//!
//! ```bash
//! cargo bench -p wallet-ledger
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wallet_ledger::{Holder, Ledger, Math, NewWallet};

fn bench_math(c: &mut Criterion) {
    let math = Math::default();

    c.bench_function("math_add", |b| {
        b.iter(|| {
            math.add(
                black_box("123456789012345678901234567890"),
                black_box("987654321098765432109876543210"),
                Some(0),
            )
        })
    });

    c.bench_function("math_to_unscaled", |b| {
        b.iter(|| math.to_unscaled(black_box("12345.678901"), black_box(6)))
    });
}

fn bench_operations(c: &mut Criterion) {
    let ledger = Ledger::in_memory().expect("ledger");
    let wallet = ledger
        .create_wallet(NewWallet::new(Holder::new("bench", "1")))
        .expect("wallet");
    let other = ledger
        .create_wallet(NewWallet::new(Holder::new("bench", "2")))
        .expect("wallet");
    ledger
        .deposit(&wallet, "1000000000000", None)
        .expect("seed deposit");

    c.bench_function("deposit", |b| {
        b.iter(|| ledger.deposit(&wallet, black_box("10"), None))
    });

    c.bench_function("transfer", |b| {
        b.iter(|| ledger.transfer(&wallet, &other, black_box("10"), "1", None))
    });

    c.bench_function("balance_read", |b| b.iter(|| ledger.balance(&wallet)));
}

criterion_group!(benches, bench_math, bench_operations);
criterion_main!(benches);
