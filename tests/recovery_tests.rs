//! End-to-end crash/recover scenarios.
//!
//! `recover` must rebuild exactly the live-cell set of the durable arena:
//! removed keys stay gone, incomplete cells are discarded, and the result
//! depends only on the arena contents, not on the volatile history that
//! produced them.

#![allow(clippy::pedantic)]
#![expect(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use duraset::store::{CellAddr, DurableStore, MaskCell, SoftCell};
use duraset::{DurableSet, LinkFreeSet, LockSet, MrLockSet, SequentialSet, SoftSet};

#[test]
fn sequential_roundtrip() {
    common::init_tracing();

    let store = Arc::new(DurableStore::new(&[8]));
    let mut set = SequentialSet::<u64>::new(Arc::clone(&store), 8);

    for key in [4, 2, 6, 1] {
        assert!(set.insert(key, key as u64 * 10));
    }
    assert!(set.remove(2));

    set.recover(8);
    assert_eq!(set.keys(), vec![1, 4, 6]);
    assert!(set.insert(2, 20));
    assert_eq!(set.keys(), vec![1, 2, 4, 6]);
}

#[test]
fn lock_set_roundtrip() {
    common::init_tracing();

    let budgets = [4, 4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = LockSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(1, 10, 0));
    assert!(set.insert(2, 20, 1));
    assert!(set.insert(3, 30, 1));
    assert!(set.remove(3, 0));

    set.recover(&budgets);
    assert_eq!(set.keys(), vec![1, 2]);
    assert!(set.contains(1));
    assert!(!set.contains(3));
}

#[test]
fn mrlock_set_roundtrip() {
    common::init_tracing();

    let budgets = [4, 4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = MrLockSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(5, 50, 0));
    assert!(set.insert(7, 70, 1));
    assert!(set.remove(5, 1));

    set.recover(&budgets);
    assert_eq!(set.keys(), vec![7]);
    assert!(set.insert(5, 51, 0));
    assert_eq!(set.keys(), vec![5, 7]);
}

#[test]
fn linkfree_recover_ignores_incomplete_cells() {
    common::init_tracing();

    let budgets = [4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = LinkFreeSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(1, 10, 0));
    assert!(set.insert(2, 20, 0));

    // A cell the crashed writer only half-wrote: prepared, never
    // committed. The scan must discard it.
    store.flush(
        CellAddr::new(0, 0),
        MaskCell {
            key: 99,
            item: 0,
            valid_bits: 0b01,
            insert_flag: false,
            delete_flag: false,
            next: 0,
        },
    );

    set.recover(&budgets);
    assert_eq!(set.keys(), vec![1, 2]);
    assert!(!set.contains(99));
}

#[test]
fn soft_recover_ignores_unbracketed_cells() {
    common::init_tracing();

    let budgets = [4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = SoftSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(9, 90, 0));

    // A crash between valid_start and valid_end leaves a cell that must
    // not be admitted.
    store.flush(
        CellAddr::new(0, 0),
        SoftCell {
            key: 42,
            item: 0,
            valid_start: true,
            valid_end: false,
            deleted: false,
        },
    );

    set.recover(&budgets);
    assert_eq!(set.keys(), vec![9]);
    assert!(!set.contains(42));
}

#[test]
fn recovered_state_depends_only_on_live_cells() {
    common::init_tracing();

    // Two different histories with the same final live-cell key set.
    let budgets = [8, 8];

    let store_a = Arc::new(DurableStore::new(&budgets));
    let mut set_a = LinkFreeSet::<u64>::new(Arc::clone(&store_a), &budgets);
    assert!(set_a.insert(1, 0, 0));
    assert!(set_a.insert(2, 0, 1));

    let store_b = Arc::new(DurableStore::new(&budgets));
    let mut set_b = LinkFreeSet::<u64>::new(Arc::clone(&store_b), &budgets);
    assert!(set_b.insert(3, 0, 0));
    assert!(set_b.insert(1, 0, 0));
    assert!(set_b.insert(2, 0, 1));
    assert!(set_b.remove(3, 1));

    set_a.recover(&budgets);
    set_b.recover(&budgets);
    assert_eq!(set_a.keys(), set_b.keys());
}

#[test]
fn recover_after_recover_keeps_the_set() {
    common::init_tracing();

    let budgets = [4, 4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = SoftSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(11, 0, 0));
    assert!(set.insert(13, 0, 1));

    set.recover(&budgets);
    set.recover(&budgets);
    assert_eq!(set.keys(), vec![11, 13]);

    // The rebuilt set is fully usable.
    assert!(set.remove(11, 0));
    assert!(set.insert(12, 0, 1));
    assert_eq!(set.keys(), vec![12, 13]);
}

#[test]
fn recovery_report_snapshots_both_sides() {
    common::init_tracing();

    let budgets = [4];
    let store = Arc::new(DurableStore::new(&budgets));
    let mut set = LinkFreeSet::<u64>::new(Arc::clone(&store), &budgets);

    assert!(set.insert(1, 0, 0));
    assert!(set.insert(2, 0, 0));
    assert!(set.remove(2, 0));

    set.recover(&budgets);
    let report = set.last_recovery().unwrap();
    assert_eq!(report.volatile_keys, vec![1]);
    assert_eq!(report.durable_keys, vec![1]);
}
