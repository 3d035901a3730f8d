//! Durable sorted set with fine-grained two-node locking.
//!
//! Every node owns a mutex. Writers walk the list unlocked, acquire the
//! predecessor's lock then the target's, and **validate** that the pair is
//! still adjacent and the target not tombstoned; a failed validation
//! releases both and retries. Traversal order is total along the list, so
//! predecessor-then-successor acquisition cannot deadlock.
//!
//! `contains` never locks: it accepts stale reads, which is safe because
//! nodes are never freed between recovers.

use std::sync::Arc;

use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;

use crate::keyspace::KeyBounds;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::NodePool;
use crate::set::{DurableSet, RecoveryReport, WriterId};
use crate::store::{CellAddr, INSERT_COMMITTED, INSERT_PREPARED, MaskCell, MaskStore};
use crate::tagged::{MARK_MASK, pack, ptr_of, tag_of};
use crate::tracing_helpers::{debug_log, warn_log};

#[repr(align(8))]
struct Node<T> {
    key: i64,
    item: T,
    /// Mutated only while unpublished or under this node's lock window.
    valid_bits: u8,
    /// Tagged link word; bit 0 tombstones the node.
    next: AtomicUsize,
    mtx: Mutex<()>,
    addr: CellAddr,
}

impl<T: Copy + Default> Node<T> {
    fn blank() -> Self {
        Self {
            key: 0,
            item: T::default(),
            valid_bits: 0,
            next: AtomicUsize::new(0),
            mtx: Mutex::new(()),
            addr: CellAddr::default(),
        }
    }

    fn sentinel(key: i64) -> *mut Self {
        let mut node = Self::blank();
        node.key = key;
        Box::into_raw(Box::new(node))
    }
}

/// Durable sorted set with per-node validation locking.
pub struct LockSet<T: Copy + Default> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    store: Arc<MaskStore<T>>,
    pool: NodePool<Node<T>>,
    bounds: KeyBounds,
    last_recovery: Option<RecoveryReport>,
}

// SAFETY: the list is shared by design; mutation happens under per-node
// locks and publication uses release stores paired with acquire traversal.
unsafe impl<T: Copy + Default + Send> Send for LockSet<T> {}
unsafe impl<T: Copy + Default + Send + Sync> Sync for LockSet<T> {}

impl<T: Copy + Default> LockSet<T> {
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

    fn find(&self, key: i64) -> (*mut Node<T>, *mut Node<T>) {
        let mut prev = self.head;
        // SAFETY: nodes are never freed between recovers, so every link
        // dereference is valid even when the walk races with removals.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*prev).next.load(READ_ORD), MARK_MASK);
            while (*cur).key < key {
                prev = cur;
                cur = ptr_of((*cur).next.load(READ_ORD), MARK_MASK);
            }
            (prev, cur)
        }
    }

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

    unsafe fn flush_insert(&self, node: *mut Node<T>) {
        // SAFETY: caller guarantees `node` is initialized.
        let node = unsafe { &*node };
        self.store.flush(
            node.addr,
            MaskCell {
                key: node.key,
                item: node.item,
                valid_bits: node.valid_bits,
                insert_flag: true,
                delete_flag: false,
                next: node.next.load(RELAXED),
            },
        );
    }

    unsafe fn flush_delete(&self, node: *mut Node<T>) {
        // SAFETY: caller guarantees `node` is initialized.
        let node = unsafe { &*node };
        self.store.flush(
            node.addr,
            MaskCell {
                key: node.key,
                item: node.item,
                valid_bits: node.valid_bits,
                insert_flag: true,
                delete_flag: true,
                next: node.next.load(RELAXED),
            },
        );
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
    /// Callers must have quiesced all writers. Pools are resized to
    /// `budgets[w] + live(w)`.
    pub fn recover(&mut self, budgets: &[usize]) {
        let recovered = self.store.read_reset();
        let report = RecoveryReport {
            volatile_keys: self.keys(),
            durable_keys: recovered.keys.clone(),
        };
        debug_log!(live = recovered.total(), "lock-set recover");

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

impl<T: Copy + Default> DurableSet<T> for LockSet<T> {
    fn insert(&self, key: i64, item: T, writer: WriterId) -> bool {
        loop {
            let (prev, cur) = self.find(key);
            // SAFETY: nodes are never freed between recovers; the lock pair
            // plus validation re-establishes adjacency before mutation.
            unsafe {
                let _prev_guard = (*prev).mtx.lock();
                let _cur_guard = (*cur).mtx.lock();

                // Validate the pair is still adjacent and live.
                if (*prev).next.load(READ_ORD) != pack(cur, 0)
                    || tag_of((*cur).next.load(READ_ORD), MARK_MASK) != 0
                {
                    continue;
                }
                if (*cur).key == key {
                    return false;
                }
                let Some(node) = self.alloc(writer) else {
                    return false; // No memory available
                };
                (*node).valid_bits |= INSERT_PREPARED;
                (*node).key = key;
                (*node).item = item;
                (*node).next.store(pack(cur, 0), RELAXED);
                (*prev).next.store(pack(node, 0), WRITE_ORD);
                self.commit_alloc(writer);
                (*node).valid_bits |= INSERT_COMMITTED;
                self.flush_insert(node);
                return true;
            }
        }
    }

    fn remove(&self, key: i64, _writer: WriterId) -> bool {
        loop {
            let (prev, cur) = self.find(key);
            // SAFETY: as in `insert`.
            unsafe {
                let _prev_guard = (*prev).mtx.lock();
                let _cur_guard = (*cur).mtx.lock();

                if (*prev).next.load(READ_ORD) != pack(cur, 0)
                    || tag_of((*cur).next.load(READ_ORD), MARK_MASK) != 0
                {
                    continue;
                }
                if (*cur).key != key {
                    return false;
                }
                let successor = ptr_of::<Node<T>>((*cur).next.load(READ_ORD), MARK_MASK);
                (*cur).next.store(pack(successor, 1), WRITE_ORD); // logical delete
                (*prev).next.store(pack(successor, 0), WRITE_ORD); // physical unlink
                self.flush_delete(cur);
                return true;
            }
        }
    }

    fn contains(&self, key: i64) -> bool {
        // SAFETY: unlocked traversal is safe because nodes are never freed
        // between recovers.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), MARK_MASK);
            while (*cur).key < key {
                cur = ptr_of((*cur).next.load(READ_ORD), MARK_MASK);
            }
            (*cur).key == key && tag_of((*cur).next.load(READ_ORD), MARK_MASK) == 0
        }
    }
}

impl<T: Copy + Default> Drop for LockSet<T> {
    fn drop(&mut self) {
        // SAFETY: sentinels are exclusively owned at drop time.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}
