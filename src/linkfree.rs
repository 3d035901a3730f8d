//! Lock-free durable sorted set with pointer marking.
//!
//! A Harris-style sorted list: the low bit of a node's `next` word is the
//! tombstone, set by a single CAS at the remove linearization point.
//! Durability rides on two per-node validity bits
//! ([`INSERT_PREPARED`]/[`INSERT_COMMITTED`]) mirrored into the node's
//! durable cell, plus two flush-deduplication flags so helping threads do
//! not redundantly FLUSH.
//!
//! # Helping
//!
//! - a duplicate-key `insert` and a successful `contains` re-validate and
//!   re-flush the found node, so the arena converges even if the original
//!   inserter died between linking and FLUSH;
//! - traversal trims tombstoned nodes it passes, flushing their delete
//!   record first.
//!
//! # Ordering
//!
//! Validity-bit promotions use release stores; the publishing CAS is
//! acquire-release. A release fence sits between the "insert prepared"
//! store and the payload writes, so a recovery scan can never observe a
//! fully-valid cell whose key and item were not yet written.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, fence};

use crate::keyspace::KeyBounds;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::NodePool;
use crate::set::{DurableSet, RecoveryReport, WriterId};
use crate::store::{CellAddr, INSERT_COMMITTED, INSERT_PREPARED, MaskCell, MaskStore};
use crate::tagged::{MARK_MASK, pack, ptr_of, tag_of};
use crate::tracing_helpers::{debug_log, warn_log};

#[repr(align(8))]
struct Node<T> {
    key: i64,
    item: T,
    /// [`INSERT_PREPARED`] | [`INSERT_COMMITTED`].
    valid_bits: AtomicU8,
    /// The insert FLUSH for this node already reached the arena.
    insert_flushed: AtomicBool,
    /// The delete FLUSH for this node already reached the arena.
    delete_flushed: AtomicBool,
    /// Tagged link word; bit 0 tombstones the node.
    next: AtomicUsize,
    addr: CellAddr,
}

impl<T: Copy + Default> Node<T> {
    fn blank() -> Self {
        Self {
            key: 0,
            item: T::default(),
            valid_bits: AtomicU8::new(0),
            insert_flushed: AtomicBool::new(false),
            delete_flushed: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            addr: CellAddr::default(),
        }
    }

    fn sentinel(key: i64) -> *mut Self {
        let mut node = Self::blank();
        node.key = key;
        Box::into_raw(Box::new(node))
    }

    fn flip_v1(&self) {
        self.valid_bits.fetch_or(INSERT_PREPARED, WRITE_ORD);
    }

    fn make_valid(&self) {
        self.valid_bits.fetch_or(INSERT_COMMITTED, WRITE_ORD);
    }

    fn record(&self) -> MaskCell<T> {
        MaskCell {
            key: self.key,
            item: self.item,
            valid_bits: self.valid_bits.load(READ_ORD),
            insert_flag: self.insert_flushed.load(READ_ORD),
            delete_flag: self.delete_flushed.load(READ_ORD),
            next: self.next.load(READ_ORD),
        }
    }

    /// FLUSH the insert record unless some thread already did.
    fn flush_insert(&self, store: &MaskStore<T>) {
        if !self.insert_flushed.load(READ_ORD) {
            store.flush(self.addr, self.record());
            self.insert_flushed.store(true, WRITE_ORD);
        }
    }

    /// FLUSH the delete record unless some thread already did.
    fn flush_delete(&self, store: &MaskStore<T>) {
        if !self.delete_flushed.load(READ_ORD) {
            store.flush(self.addr, self.record());
            self.delete_flushed.store(true, WRITE_ORD);
        }
    }
}

/// Lock-free durable sorted set.
pub struct LinkFreeSet<T: Copy + Default> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    store: Arc<MaskStore<T>>,
    pool: NodePool<Node<T>>,
    bounds: KeyBounds,
    last_recovery: Option<RecoveryReport>,
}

// SAFETY: all shared mutation goes through atomics; nodes are never freed
// between recovers.
unsafe impl<T: Copy + Default + Send> Send for LinkFreeSet<T> {}
unsafe impl<T: Copy + Default + Send + Sync> Sync for LinkFreeSet<T> {}

impl<T: Copy + Default> LinkFreeSet<T> {
    /// Create a set backed by `store` with one write budget per writer.
    #[must_use]
    pub fn new(store: Arc<MaskStore<T>>, budgets: &[usize]) -> Self {
        Self::with_bounds(store, budgets, KeyBounds::default())
    }

    /// As [`new`](Self::new), with explicit sentinel bounds.
    #[must_use]
    pub fn with_bounds(store: Arc<MaskStore<T>>, budgets: &[usize], bounds: KeyBounds) -> Self {
        let head = Node::sentinel(bounds.min_key);
        let tail = Node::sentinel(bounds.max_key);
        // SAFETY: both sentinels were just allocated.
        unsafe {
            (*head).next.store(pack(tail, 0), RELAXED);
        }
        Self {
            head,
            tail,
            store,
            pool: NodePool::new(budgets, Node::blank),
            bounds,
            last_recovery: None,
        }
    }

    /// Sentinel configuration of this instance.
    #[must_use]
    pub fn bounds(&self) -> KeyBounds {
        self.bounds
    }

    /// Walk to the first live node with `node.key >= key`, trimming
    /// tombstoned nodes encountered along the way.
    fn find(&self, key: i64) -> (*mut Node<T>, *mut Node<T>) {
        // SAFETY: nodes are never freed between recovers, so every link
        // dereference is valid even mid-race.
        unsafe {
            let mut prev = self.head;
            let mut cur = ptr_of::<Node<T>>((*prev).next.load(READ_ORD), MARK_MASK);
            loop {
                if tag_of((*cur).next.load(READ_ORD), MARK_MASK) == 0 {
                    if (*cur).key >= key {
                        break;
                    }
                    prev = cur;
                } else {
                    // Unlink the logically deleted node in passing.
                    self.trim(prev, cur);
                }
                cur = ptr_of((*cur).next.load(READ_ORD), MARK_MASK);
            }
            (prev, cur)
        }
    }

    /// Physically unlink `cur`, flushing its delete record first.
    ///
    /// `cur` must already be valid and tombstoned, which keeps new nodes
    /// from being inserted behind it.
    unsafe fn trim(&self, prev: *mut Node<T>, cur: *mut Node<T>) -> bool {
        // SAFETY: caller guarantees both nodes are reachable pool nodes.
        unsafe {
            (*cur).flush_delete(&self.store);
            let successor = ptr_of::<Node<T>>((*cur).next.load(READ_ORD), MARK_MASK);
            (*prev)
                .next
                .compare_exchange(pack(cur, 0), pack(successor, 0), CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
        }
    }

    /// Bind the writer's next pool node to its current free cell.
    ///
    /// The pairing is stable across failed publication attempts: neither
    /// cursor advances until [`commit_alloc`](Self::commit_alloc).
    fn alloc(&self, writer: WriterId) -> Option<*mut Node<T>> {
        let node = self.pool.peek(writer as usize)?;
        let Some(index) = self.store.retrieve_address(writer) else {
            warn_log!(writer, "durable arena exhausted");
            return None;
        };
        // SAFETY: the peeked node is unpublished and owned by this writer.
        unsafe {
            (*node).addr = CellAddr::new(writer, index);
        }
        Some(node)
    }

    fn commit_alloc(&self, writer: WriterId) {
        self.pool.commit(writer as usize);
        self.store.update_address(writer);
    }

    /// Ascending keys at a quiescent point, tombstoned nodes skipped.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        let mut out = Vec::new();
        // SAFETY: quiescent walk between the sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), MARK_MASK);
            while cur != self.tail {
                let word = (*cur).next.load(READ_ORD);
                if tag_of(word, MARK_MASK) == 0 {
                    out.push((*cur).key);
                }
                cur = ptr_of(word, MARK_MASK);
            }
        }
        out
    }

    /// Number of keys at a quiescent point.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Whether the set holds no keys, at a quiescent point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostics captured by the most recent [`recover`](Self::recover).
    #[must_use]
    pub fn last_recovery(&self) -> Option<&RecoveryReport> {
        self.last_recovery.as_ref()
    }

    /// Rebuild the list from the live cells of the durable arena.
    ///
    /// Callers must have quiesced all writers.
    pub fn recover(&mut self, budgets: &[usize]) {
        let recovered = self.store.read_reset();
        let report = RecoveryReport {
            volatile_keys: self.keys(),
            durable_keys: recovered.keys.clone(),
        };
        debug_log!(live = recovered.total(), "link-free recover");

        // SAFETY: writers are quiesced; sentinels are exclusively owned and
        // the pool rebuild reclaims every other node.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
        let sizes: Vec<usize> = budgets
            .iter()
            .zip(&recovered.per_writer)
            .map(|(&budget, &live)| budget + live)
            .collect();
        self.pool.rebuild(&sizes, Node::blank);
        self.head = Node::sentinel(self.bounds.min_key);
        self.tail = Node::sentinel(self.bounds.max_key);
        // SAFETY: fresh sentinels.
        unsafe {
            (*self.head).next.store(pack(self.tail, 0), RELAXED);
        }

        for i in 0..recovered.total() {
            let _ = DurableSet::insert(self, recovered.keys[i], recovered.items[i], recovered.writers[i]);
        }
        self.last_recovery = Some(report);
    }
}

impl<T: Copy + Default> DurableSet<T> for LinkFreeSet<T> {
    fn insert(&self, key: i64, item: T, writer: WriterId) -> bool {
        loop {
            let (prev, cur) = self.find(key);
            // SAFETY: find returns reachable pool nodes or sentinels.
            unsafe {
                if (*cur).key == key {
                    // Help a possibly-crashed inserter complete its flush.
                    (*cur).make_valid();
                    (*cur).flush_insert(&self.store);
                    return false;
                }
                let Some(node) = self.alloc(writer) else {
                    return false; // No memory available
                };
                (*node).flip_v1();
                fence(WRITE_ORD);
                (*node).key = key;
                (*node).item = item;
                (*node).next.store(pack(cur, 0), RELAXED);
                if (*prev)
                    .next
                    .compare_exchange(pack(cur, 0), pack(node, 0), CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
                {
                    // Linearization point.
                    self.commit_alloc(writer);
                    (*node).make_valid();
                    (*node).flush_insert(&self.store);
                    return true;
                }
            }
        }
    }

    fn remove(&self, key: i64, _writer: WriterId) -> bool {
        loop {
            let (prev, cur) = self.find(key);
            // SAFETY: find returns reachable pool nodes or sentinels.
            unsafe {
                if (*cur).key != key {
                    return false;
                }
                let successor = ptr_of::<Node<T>>((*cur).next.load(READ_ORD), MARK_MASK);
                (*cur).make_valid();
                if (*cur)
                    .next
                    .compare_exchange(
                        pack(successor, 0),
                        pack(successor, 1),
                        CAS_SUCCESS,
                        CAS_FAILURE,
                    )
                    .is_ok()
                {
                    // Linearization point: cur is valid and tombstoned.
                    self.trim(prev, cur);
                    return true;
                }
            }
        }
    }

    fn contains(&self, key: i64) -> bool {
        // SAFETY: traversal dereferences only pool nodes and sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), MARK_MASK);
            while (*cur).key < key {
                cur = ptr_of((*cur).next.load(READ_ORD), MARK_MASK);
            }
            if (*cur).key != key {
                return false;
            }
            if tag_of((*cur).next.load(READ_ORD), MARK_MASK) != 0 {
                // Tombstoned: help persist the delete, report absent.
                (*cur).flush_delete(&self.store);
                return false;
            }
            // Present: help persist the insert before reporting it.
            (*cur).make_valid();
            (*cur).flush_insert(&self.store);
            true
        }
    }
}

impl<T: Copy + Default> Drop for LinkFreeSet<T> {
    fn drop(&mut self) {
        // SAFETY: sentinels are exclusively owned at drop time.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}
