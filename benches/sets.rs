//! Throughput comparison across the durable-set variants.
//!
//! **Methodology:**
//! - Identical scrambled key sequences for every variant
//! - Pre-allocated inputs to avoid measuring key generation
//! - `BTreeSet` as the non-durable baseline
//!
//! Run with: `cargo bench --bench sets`

#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use divan::{Bencher, black_box};

use duraset::store::DurableStore;
use duraset::{DurableSet, LinkFreeSet, LockSet, MrLockSet, SequentialSet, SoftSet};

fn main() {
    divan::main();
}

const N: usize = 1024;

/// Scrambled keys well inside the sentinel bounds.
fn scrambled_keys(n: usize) -> Vec<i64> {
    (0..n)
        .map(|i| ((i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % 180_000) as i64 - 90_000)
        .collect()
}

// =============================================================================
// Insert throughput (single writer)
// =============================================================================

#[divan::bench]
fn insert_btreeset(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(BTreeSet::new)
        .bench_local_values(|mut set: BTreeSet<i64>| {
            for &key in &keys {
                black_box(set.insert(key));
            }
            set
        });
}

#[divan::bench]
fn insert_sequential(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(|| SequentialSet::<u64>::new(Arc::new(DurableStore::new(&[N])), N))
        .bench_local_values(|mut set| {
            for &key in &keys {
                black_box(set.insert(key, 0));
            }
            set
        });
}

#[divan::bench]
fn insert_lock(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(|| LockSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]))
        .bench_local_values(|set| {
            for &key in &keys {
                black_box(set.insert(key, 0, 0));
            }
            set
        });
}

#[divan::bench]
fn insert_mrlock(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(|| MrLockSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]))
        .bench_local_values(|set| {
            for &key in &keys {
                black_box(set.insert(key, 0, 0));
            }
            set
        });
}

#[divan::bench]
fn insert_linkfree(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(|| LinkFreeSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]))
        .bench_local_values(|set| {
            for &key in &keys {
                black_box(set.insert(key, 0, 0));
            }
            set
        });
}

#[divan::bench]
fn insert_soft(bencher: Bencher) {
    let keys = scrambled_keys(N);
    bencher
        .with_inputs(|| SoftSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]))
        .bench_local_values(|set| {
            for &key in &keys {
                black_box(set.insert(key, 0, 0));
            }
            set
        });
}

// =============================================================================
// Lookup throughput over a populated set
// =============================================================================

#[divan::bench]
fn contains_linkfree(bencher: Bencher) {
    let keys = scrambled_keys(N);
    let set = LinkFreeSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]);
    for &key in &keys {
        set.insert(key, 0, 0);
    }
    bencher.bench_local(|| {
        for &key in &keys {
            black_box(set.contains(key));
        }
    });
}

#[divan::bench]
fn contains_soft(bencher: Bencher) {
    let keys = scrambled_keys(N);
    let set = SoftSet::<u64>::new(Arc::new(DurableStore::new(&[N])), &[N]);
    for &key in &keys {
        set.insert(key, 0, 0);
    }
    bencher.bench_local(|| {
        for &key in &keys {
            black_box(set.contains(key));
        }
    });
}

// =============================================================================
// Insert/remove churn
// =============================================================================

#[divan::bench]
fn churn_linkfree(bencher: Bencher) {
    let keys = scrambled_keys(64);
    bencher
        .with_inputs(|| LinkFreeSet::<u64>::new(Arc::new(DurableStore::new(&[64 * 8])), &[64 * 8]))
        .bench_local_values(|set| {
            for _ in 0..8 {
                for &key in &keys {
                    set.insert(key, 0, 0);
                }
                for &key in &keys {
                    set.remove(key, 0);
                }
            }
            set
        });
}

#[divan::bench]
fn churn_soft(bencher: Bencher) {
    let keys = scrambled_keys(64);
    bencher
        .with_inputs(|| SoftSet::<u64>::new(Arc::new(DurableStore::new(&[64 * 8])), &[64 * 8]))
        .bench_local_values(|set| {
            for _ in 0..8 {
                for &key in &keys {
                    set.insert(key, 0, 0);
                }
                for &key in &keys {
                    set.remove(key, 0);
                }
            }
            set
        });
}
