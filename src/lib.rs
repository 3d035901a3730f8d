//! # duraset
//!
//! A family of durable concurrent sorted sets keyed by signed integers.
//!
//! Every logical mutation (insert/delete) is reflected into a simulated
//! persistent arena - the [durable store](store) - so that after a crash
//! the in-memory set can be deterministically reconstructed from the arena
//! alone. Four interoperable concurrent variants plus a sequential
//! baseline cover the concurrency-control design space:
//!
//! - [`SequentialSet`] - single-threaded reference list
//! - [`LockSet`] - hand-over-hand two-node validation locking
//! - [`MrLockSet`] - bitmask multi-resource locking ([`MrLock`])
//! - [`LinkFreeSet`] - lock-free CAS list with pointer low-bit marking
//! - [`SoftSet`] - lock-free four-state protocol splitting the volatile
//!   linking lifecycle from the durable persistence lifecycle
//!
//! ## Design
//!
//! All variants share one contract: `insert`/`remove`/`contains` plus a
//! single-threaded `recover` that rescans the arena and rebuilds the list
//! from its live cells. Nodes come from pre-allocated per-writer pools and
//! are never freed between recovers, which is what makes unlocked
//! traversal safe everywhere. Each durable cell encodes its own
//! completeness, so a crash mid-FLUSH is invisible after recovery.
//!
//! ```rust
//! use std::sync::Arc;
//! use duraset::{DurableSet, LinkFreeSet, store::DurableStore};
//!
//! let budgets = [8, 8];
//! let store = Arc::new(DurableStore::new(&budgets));
//! let mut set = LinkFreeSet::<u64>::new(store, &budgets);
//!
//! assert!(set.insert(3, 30, 0));
//! assert!(set.insert(1, 10, 1));
//! assert!(set.contains(3));
//!
//! // Crash: throw the volatile list away, rebuild from the arena.
//! set.recover(&budgets);
//! assert_eq!(set.keys(), vec![1, 3]);
//! ```

pub mod keyspace;
pub mod linkfree;
pub mod lock;
pub mod mrlock;
pub mod mrlock_set;
pub mod ordering;
pub mod sequential;
pub mod set;
pub mod soft;
pub mod store;

mod pool;
mod tagged;
mod tracing_helpers;



pub use linkfree::LinkFreeSet;
pub use lock::LockSet;
pub use mrlock::MrLock;
pub use mrlock_set::MrLockSet;
pub use sequential::SequentialSet;
pub use set::{DurableSet, RecoveryReport, WriterId};
pub use soft::SoftSet;
