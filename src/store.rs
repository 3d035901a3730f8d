//! The simulated durable store.
//!
//! [`DurableStore`] is a bounded, pre-sized arena of durable cells,
//! partitioned per writer: `cells[writer][index]`. It issues per-writer
//! cell indices, mirrors node records into cells (`FLUSH`), and performs
//! the scan-and-reset pass that recovery is built on.
//!
//! # Concurrency Model
//!
//! - `retrieve_address`/`update_address` touch only the calling writer's
//!   cursor; a writer id is driven by one thread, so the cursors are
//!   relaxed atomics.
//! - `flush` may race between helpers mirroring the same node; each cell
//!   sits behind its own mutex, which is what makes a FLUSH atomic from
//!   the arena's perspective.
//! - `read_reset` must not run concurrently with any other operation;
//!   callers quiesce writers first.
//!
//! # Address issuance
//!
//! Cell indices are issued in strictly decreasing order from `C(w)-1` down
//! to `0`, and a cell is never reissued within an epoch. `read_reset`
//! resets every cursor to `0` and flips issuance to ascending, so
//! re-inserts after a crash fill the arena from low indices upward. Both
//! orders are legal: the invariant is only that no two live nodes share a
//! coordinate. Exhaustion in either direction surfaces as `None` from
//! [`retrieve_address`](DurableStore::retrieve_address).

mod cell;

use std::sync::atomic::{AtomicBool, AtomicIsize};

use parking_lot::Mutex;

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

pub use cell::{DurableCell, INSERT_COMMITTED, INSERT_PREPARED, INSERT_VALID, MaskCell, SoftCell};

/// Bit-mask-flavor arena (sequential / lock / MRLock / link-free sets).
pub type MaskStore<T> = DurableStore<MaskCell<T>>;

/// SOFT-flavor arena.
pub type SoftStore<T> = DurableStore<SoftCell<T>>;

// ============================================================================
//  CellAddr
// ============================================================================

/// Durable coordinate binding a volatile node to exactly one arena cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellAddr {
    /// Owning writer id (arena row).
    pub writer: u32,
    /// Cell index within the writer's section (arena column).
    pub index: usize,
}

impl CellAddr {
    /// Coordinate for `writer`/`index`.
    #[must_use]
    pub const fn new(writer: u32, index: usize) -> Self {
        Self { writer, index }
    }
}

// ============================================================================
//  RecoveredCells
// ============================================================================

/// Live cells collected by [`DurableStore::read_reset`], in scan order
/// (writer-major, ascending cell index).
#[derive(Debug, Clone, Default)]
pub struct RecoveredCells<I> {
    /// Key of each live cell.
    pub keys: Vec<i64>,
    /// Payload of each live cell.
    pub items: Vec<I>,
    /// Owning writer of each live cell.
    pub writers: Vec<u32>,
    /// Live-cell count per writer section.
    pub per_writer: Vec<usize>,
}

impl<I> RecoveredCells<I> {
    /// Total number of live cells across all writers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.keys.len()
    }
}

// ============================================================================
//  DurableStore
// ============================================================================

struct Section<C> {
    cells: Vec<Mutex<C>>,
    /// Next index to issue; counts toward the epoch's exhaustion bound.
    cursor: AtomicIsize,
}

/// Bounded per-writer arena of durable cells.
pub struct DurableStore<C> {
    sections: Vec<Section<C>>,
    /// False until the first `read_reset`; selects the issuance direction.
    ascending: AtomicBool,
}

impl<C: DurableCell> DurableStore<C> {
    /// Pre-size the arena with one section per writer.
    ///
    /// `budgets[w]` must upper-bound writer `w`'s successful inserts within
    /// an epoch.
    #[must_use]
    pub fn new(budgets: &[usize]) -> Self {
        let sections = budgets
            .iter()
            .map(|&budget| Section {
                cells: (0..budget).map(|_| Mutex::new(C::default())).collect(),
                cursor: AtomicIsize::new(budget as isize - 1),
            })
            .collect();
        Self {
            sections,
            ascending: AtomicBool::new(false),
        }
    }

    /// Number of writer sections.
    #[must_use]
    pub fn writers(&self) -> usize {
        self.sections.len()
    }

    /// Cell capacity of one writer's section.
    #[must_use]
    pub fn capacity(&self, writer: u32) -> usize {
        self.sections[writer as usize].cells.len()
    }

    /// The writer's current free cell index, without consuming it.
    ///
    /// Returns `None` once the writer's budget is exhausted. Must be paired
    /// with [`update_address`](Self::update_address) only after a FLUSH
    /// that used the returned index.
    #[must_use]
    pub fn retrieve_address(&self, writer: u32) -> Option<usize> {
        let section = &self.sections[writer as usize];
        let cursor = section.cursor.load(RELAXED);
        if self.ascending.load(READ_ORD) {
            (cursor >= 0 && (cursor as usize) < section.cells.len()).then_some(cursor as usize)
        } else {
            (cursor >= 0).then_some(cursor as usize)
        }
    }

    /// Consume the writer's current free cell index.
    pub fn update_address(&self, writer: u32) {
        let section = &self.sections[writer as usize];
        if self.ascending.load(READ_ORD) {
            section.cursor.fetch_add(1, RELAXED);
        } else {
            section.cursor.fetch_sub(1, RELAXED);
        }
    }

    /// Mirror a full node record into the addressed cell.
    ///
    /// The write is atomic from the arena's perspective; it is the set's
    /// responsibility to keep the validity encoding monotonic with respect
    /// to visibility. Helpers may flush the same node concurrently with
    /// identical contents.
    pub fn flush(&self, addr: CellAddr, record: C) {
        *self.sections[addr.writer as usize].cells[addr.index].lock() = record;
    }

    /// Scan the whole arena, returning live cells and blanking everything.
    ///
    /// Every cell is cleared, every cursor is reset to `0`, and issuance
    /// flips to ascending. Must not be called concurrently with any other
    /// store operation.
    pub fn read_reset(&self) -> RecoveredCells<C::Item> {
        let mut out = RecoveredCells {
            per_writer: vec![0; self.sections.len()],
            ..RecoveredCells::default()
        };
        for (writer, section) in self.sections.iter().enumerate() {
            section.cursor.store(0, RELAXED);
            for slot in &section.cells {
                let mut cell = slot.lock();
                if cell.is_live() {
                    out.keys.push(cell.key());
                    out.items.push(cell.item());
                    out.writers.push(writer as u32);
                    out.per_writer[writer] += 1;
                }
                cell.clear();
            }
        }
        self.ascending.store(true, WRITE_ORD);
        out
    }

    /// Snapshot of one cell, for diagnostics and tests.
    #[must_use]
    pub fn read_cell(&self, addr: CellAddr) -> C {
        self.sections[addr.writer as usize].cells[addr.index].lock().clone()
    }
}
