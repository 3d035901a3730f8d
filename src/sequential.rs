//! Single-threaded durable sorted set.
//!
//! The reference list for the concurrent variants: same node layout, same
//! durable reflection protocol, no synchronization. Insert prepares the
//! validity bits, links the node, commits, then FLUSHes; remove marks the
//! victim's link word (logical delete), unlinks it, then FLUSHes the
//! tombstoned record.

use std::sync::Arc;

use crate::keyspace::KeyBounds;
use crate::pool::NodePool;
use crate::set::RecoveryReport;
use crate::store::{CellAddr, INSERT_COMMITTED, INSERT_PREPARED, MaskCell, MaskStore};
use crate::tagged::{MARK_MASK, pack, ptr_of};
use crate::tracing_helpers::{debug_log, warn_log};

/// The sequential set services the single writer id 0.
const WRITER: u32 = 0;

#[repr(align(8))]
struct Node<T> {
    key: i64,
    item: T,
    valid_bits: u8,
    /// Tagged link word; bit 0 tombstones the node.
    next: usize,
    addr: CellAddr,
}

impl<T: Copy + Default> Node<T> {
    fn blank() -> Self {
        Self {
            key: 0,
            item: T::default(),
            valid_bits: 0,
            next: 0,
            addr: CellAddr::default(),
        }
    }

    fn sentinel(key: i64) -> *mut Self {
        let mut node = Self::blank();
        node.key = key;
        Box::into_raw(Box::new(node))
    }
}

/// Durable sorted set without synchronization.
pub struct SequentialSet<T: Copy + Default> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    store: Arc<MaskStore<T>>,
    pool: NodePool<Node<T>>,
    bounds: KeyBounds,
    last_recovery: Option<RecoveryReport>,
}

// SAFETY: the set owns every node it points to; the &mut API prevents
// concurrent access.
unsafe impl<T: Copy + Default + Send> Send for SequentialSet<T> {}

impl<T: Copy + Default> SequentialSet<T> {
    /// Create a set backed by `store`, able to absorb `budget` successful
    /// inserts. The store must carry at least one writer section of the
    /// same capacity.
    #[must_use]
    pub fn new(store: Arc<MaskStore<T>>, budget: usize) -> Self {
        Self::with_bounds(store, budget, KeyBounds::default())
    }

    /// As [`new`](Self::new), with explicit sentinel bounds.
    #[must_use]
    pub fn with_bounds(store: Arc<MaskStore<T>>, budget: usize, bounds: KeyBounds) -> Self {
        let head = Node::sentinel(bounds.min_key);
        let tail = Node::sentinel(bounds.max_key);
        // SAFETY: both sentinels were just allocated.
        unsafe {
            (*head).next = pack(tail, 0);
        }
        Self {
            head,
            tail,
            store,
            pool: NodePool::new(&[budget], Node::blank),
            bounds,
            last_recovery: None,
        }
    }

    /// Sentinel configuration of this instance.
    #[must_use]
    pub fn bounds(&self) -> KeyBounds {
        self.bounds
    }

    /// Walk to the first node with `node.key >= key`, returning it and its
    /// predecessor.
    fn find(&self, key: i64) -> (*mut Node<T>, *mut Node<T>) {
        let mut prev = self.head;
        // SAFETY: traversal stays between the sentinels; links of reachable
        // nodes always point at pool nodes or the tail.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*prev).next, MARK_MASK);
            while (*cur).key < key {
                prev = cur;
                cur = ptr_of((*cur).next, MARK_MASK);
            }
            (prev, cur)
        }
    }

    /// Bind the next pool node to the writer's current free cell.
    fn alloc(&self) -> Option<*mut Node<T>> {
        let node = self.pool.peek(WRITER as usize)?;
        let Some(index) = self.store.retrieve_address(WRITER) else {
            warn_log!(writer = WRITER, "durable arena exhausted");
            return None;
        };
        // SAFETY: the peeked node is unpublished and owned by this writer.
        unsafe {
            (*node).addr = CellAddr::new(WRITER, index);
        }
        Some(node)
    }

    fn commit_alloc(&self) {
        self.pool.commit(WRITER as usize);
        self.store.update_address(WRITER);
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
                next: node.next,
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
                next: node.next,
            },
        );
    }

    /// Insert `key`, returning `true` if newly inserted.
    pub fn insert(&mut self, key: i64, item: T) -> bool {
        let (prev, cur) = self.find(key);
        // SAFETY: find returns reachable, live nodes.
        unsafe {
            if (*cur).key == key {
                return false;
            }
            let Some(node) = self.alloc() else {
                return false; // No memory available
            };
            (*node).valid_bits |= INSERT_PREPARED;
            (*node).key = key;
            (*node).item = item;
            (*node).next = pack(cur, 0);
            (*prev).next = pack(node, 0);
            self.commit_alloc();
            (*node).valid_bits |= INSERT_COMMITTED;
            self.flush_insert(node);
        }
        true
    }

    /// Remove `key`, returning `true` if it was present.
    pub fn remove(&mut self, key: i64) -> bool {
        let (prev, cur) = self.find(key);
        // SAFETY: find returns reachable, live nodes.
        unsafe {
            if (*cur).key != key {
                return false;
            }
            let successor = ptr_of::<Node<T>>((*cur).next, MARK_MASK);
            (*cur).next = pack(successor, 1); // logical delete
            (*prev).next = pack(successor, 0); // physical unlink
            self.flush_delete(cur);
        }
        true
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: i64) -> bool {
        // SAFETY: traversal stays between the sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next, MARK_MASK);
            while (*cur).key < key {
                cur = ptr_of((*cur).next, MARK_MASK);
            }
            (*cur).key == key
        }
    }

    /// Ascending keys currently in the set.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        let mut out = Vec::new();
        // SAFETY: traversal stays between the sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next, MARK_MASK);
            while cur != self.tail {
                out.push((*cur).key);
                cur = ptr_of((*cur).next, MARK_MASK);
            }
        }
        out
    }

    /// Number of keys currently in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostics captured by the most recent [`recover`](Self::recover).
    #[must_use]
    pub fn last_recovery(&self) -> Option<&RecoveryReport> {
        self.last_recovery.as_ref()
    }

    /// Discard all volatile state and rebuild the list from the live cells
    /// of the durable arena.
    ///
    /// `budget` upper-bounds the successful inserts of the next epoch; the
    /// pool is resized to `budget + live` so the surviving cells can be
    /// re-installed on top of it.
    pub fn recover(&mut self, budget: usize) {
        let recovered = self.store.read_reset();
        let report = RecoveryReport {
            volatile_keys: self.keys(),
            durable_keys: recovered.keys.clone(),
        };
        debug_log!(
            live = recovered.total(),
            volatile = report.volatile_keys.len(),
            "sequential recover"
        );

        // SAFETY: teardown of exclusively-owned sentinels; the pool rebuild
        // reclaims every other node.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
        self.pool
            .rebuild(&[budget + recovered.total()], Node::blank);
        self.head = Node::sentinel(self.bounds.min_key);
        self.tail = Node::sentinel(self.bounds.max_key);
        // SAFETY: fresh sentinels.
        unsafe {
            (*self.head).next = pack(self.tail, 0);
        }

        for i in 0..recovered.total() {
            let _ = self.insert(recovered.keys[i], recovered.items[i]);
        }
        self.last_recovery = Some(report);
    }
}

impl<T: Copy + Default> Drop for SequentialSet<T> {
    fn drop(&mut self) {
        // SAFETY: sentinels are exclusively owned; pool nodes are
        // reclaimed by the pool's own drop.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "fail fast in tests")]
mod tests {
    use super::*;
    use crate::keyspace::{MAX_KEY, MIN_KEY};
    use crate::store::DurableStore;

    fn set(budget: usize) -> SequentialSet<u64> {
        SequentialSet::new(Arc::new(DurableStore::new(&[budget])), budget)
    }

    #[test]
    fn empty_set_has_nothing() {
        let mut s = set(4);
        assert!(!s.contains(5));
        assert!(!s.remove(5));
        assert!(s.is_empty());
    }

    #[test]
    fn inserts_sort_ascending() {
        let mut s = set(4);
        assert!(s.insert(3, 30));
        assert!(s.insert(1, 10));
        assert!(s.insert(2, 20));

        assert_eq!(s.keys(), vec![1, 2, 3]);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut s = set(4);
        assert!(s.insert(1, 10));
        assert!(!s.insert(1, 11));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn remove_then_contains() {
        let mut s = set(4);
        s.insert(1, 10);
        s.insert(2, 20);

        assert!(s.remove(1));
        assert!(!s.contains(1));
        assert!(s.contains(2));
        assert!(!s.remove(1));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn boundary_keys_work() {
        let mut s = set(4);
        assert!(s.insert(MIN_KEY + 1, 0));
        assert!(s.insert(MAX_KEY - 1, 0));
        assert!(s.contains(MIN_KEY + 1));
        assert!(s.contains(MAX_KEY - 1));
        assert_eq!(s.keys(), vec![MIN_KEY + 1, MAX_KEY - 1]);
    }

    #[test]
    fn exhausted_budget_rejects_insert() {
        let mut s = set(1);
        assert!(s.insert(1, 10));
        assert!(!s.insert(2, 20));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn removed_keys_do_not_survive_recover() {
        let mut s = set(4);
        s.insert(1, 10);
        s.insert(2, 20);
        s.insert(3, 30);
        s.remove(2);

        s.recover(4);
        assert_eq!(s.keys(), vec![1, 3]);
        assert!(s.contains(1));
        assert!(!s.contains(2));

        let report = s.last_recovery().unwrap();
        assert_eq!(report.volatile_keys, vec![1, 3]);
        let mut durable = report.durable_keys.clone();
        durable.sort_unstable();
        assert_eq!(durable, vec![1, 3]);
    }

    #[test]
    fn recover_honors_fresh_budget() {
        let mut s = set(2);
        s.insert(1, 10);
        s.insert(2, 20);
        assert!(!s.insert(3, 30)); // exhausted

        // Two live cells re-install and the new budget has no headroom in
        // the arena; recover still rebuilds the surviving keys.
        s.recover(2);
        assert_eq!(s.keys(), vec![1, 2]);
    }

    #[test]
    fn recover_twice_is_stable() {
        let mut s = set(4);
        s.insert(5, 50);
        s.recover(4);
        s.recover(4);
        assert_eq!(s.keys(), vec![5]);
    }
}
