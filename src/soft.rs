//! SOFT: lock-free durable sorted set with a four-state node protocol.
//!
//! Each node's lifecycle state lives in the low two bits of its own `next`
//! word:
//!
//! ```text
//! 0 INTEND_TO_INSERT   1 INSERTED   2 INTEND_TO_DELETE   3 DELETED
//! ```
//!
//! The volatile linking lifecycle is decoupled from the durable
//! persistence lifecycle: every node owns a `PNode` holding the durable
//! validity triple and coordinate, written by `create`/`destroy` around the
//! FLUSH. The `(valid_start, valid_end)` pair brackets the payload writes,
//! so a crash between the two leaves a cell that is not admitted on
//! recovery - single-bit-flip atomicity without any cell-level CAS.
//!
//! Linearization points are the state transitions: `INTEND_TO_INSERT ->
//! INSERTED` for insert and `INSERTED -> INTEND_TO_DELETE` for remove. Any
//! thread observing an intermediate state may help promote it, which makes
//! the promotions wait-free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, fence};

use crate::keyspace::KeyBounds;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::NodePool;
use crate::set::{DurableSet, RecoveryReport, WriterId};
use crate::store::{CellAddr, SoftCell, SoftStore};
use crate::tagged::{STATE_MASK, pack, ptr_of, tag_of};
use crate::tracing_helpers::{debug_log, warn_log};

// ============================================================================
//  NodeState
// ============================================================================

/// Lifecycle state embedded in the low two bits of a node's `next` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum NodeState {
    IntendToInsert = 0,
    Inserted = 1,
    IntendToDelete = 2,
    Deleted = 3,
}

impl NodeState {
    const fn from_bits(bits: usize) -> Self {
        match bits & STATE_MASK {
            0 => Self::IntendToInsert,
            1 => Self::Inserted,
            2 => Self::IntendToDelete,
            _ => Self::Deleted,
        }
    }

    const fn bits(self) -> usize {
        self as usize
    }
}

/// State bits of a loaded `next` word.
const fn state_of(word: usize) -> NodeState {
    NodeState::from_bits(tag_of(word, STATE_MASK))
}

// ============================================================================
//  PNode - durable half of the split node
// ============================================================================

/// Durable mirror owned by each volatile node.
///
/// Holds only the validity triple and the durable coordinate; key and item
/// pass through `create`/`destroy` into the FLUSH, staying plain fields on
/// the volatile node.
struct PNode {
    valid_start: AtomicBool,
    valid_end: AtomicBool,
    deleted: AtomicBool,
    addr: CellAddr,
}

impl PNode {
    fn blank() -> Self {
        Self {
            valid_start: AtomicBool::new(false),
            valid_end: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            addr: CellAddr::default(),
        }
    }

    fn flush<T: Copy + Default>(&self, key: i64, item: T, store: &SoftStore<T>) {
        store.flush(
            self.addr,
            SoftCell {
                key,
                item,
                valid_start: self.valid_start.load(READ_ORD),
                valid_end: self.valid_end.load(READ_ORD),
                deleted: self.deleted.load(READ_ORD),
            },
        );
    }

    /// Publish the durable record. Concurrent helpers write identical
    /// values, so racing `create` calls are benign.
    fn create<T: Copy + Default>(&self, key: i64, item: T, store: &SoftStore<T>) {
        self.valid_start.store(true, RELAXED);
        fence(WRITE_ORD);
        self.valid_end.store(true, WRITE_ORD);
        self.flush(key, item, store);
    }

    /// Kill the durable record.
    fn destroy<T: Copy + Default>(&self, key: i64, item: T, store: &SoftStore<T>) {
        self.deleted.store(true, WRITE_ORD);
        self.flush(key, item, store);
    }
}

// ============================================================================
//  Node - volatile half
// ============================================================================

#[repr(align(8))]
struct Node<T> {
    key: i64,
    item: T,
    pnode: PNode,
    /// Tagged link word; the low two bits are this node's state.
    next: AtomicUsize,
}

impl<T: Copy + Default> Node<T> {
    fn blank() -> Self {
        Self {
            key: 0,
            item: T::default(),
            pnode: PNode::blank(),
            next: AtomicUsize::new(0),
        }
    }

    fn sentinel(key: i64) -> *mut Self {
        let mut node = Self::blank();
        node.key = key;
        Box::into_raw(Box::new(node))
    }
}

/// Result of a traversal: the predecessor node, the word its `next` held
/// (target pointer plus the predecessor-side state bits), and the target's
/// state.
struct Found<T> {
    prev: *mut Node<T>,
    cur_word: usize,
    cur_state: NodeState,
}

// ============================================================================
//  SoftSet
// ============================================================================

/// Durable sorted set with the SOFT four-state protocol.
pub struct SoftSet<T: Copy + Default> {
    head: *mut Node<T>,
    tail_one: *mut Node<T>,
    tail_two: *mut Node<T>,
    store: Arc<SoftStore<T>>,
    pool: NodePool<Node<T>>,
    bounds: KeyBounds,
    last_recovery: Option<RecoveryReport>,
}

// SAFETY: all shared mutation goes through atomics; nodes are never freed
// between recovers.
unsafe impl<T: Copy + Default + Send> Send for SoftSet<T> {}
unsafe impl<T: Copy + Default + Send + Sync> Sync for SoftSet<T> {}

impl<T: Copy + Default> SoftSet<T> {
    /// Create a set backed by `store` with one write budget per writer.
    #[must_use]
    pub fn new(store: Arc<SoftStore<T>>, budgets: &[usize]) -> Self {
        Self::with_bounds(store, budgets, KeyBounds::default())
    }

    /// As [`new`](Self::new), with explicit sentinel bounds. The list ends
    /// in two tails, at `max_key` and `max_key + 1`.
    #[must_use]
    pub fn with_bounds(store: Arc<SoftStore<T>>, budgets: &[usize], bounds: KeyBounds) -> Self {
        let (head, tail_one, tail_two) = Self::sentinels(bounds);
        Self {
            head,
            tail_one,
            tail_two,
            store,
            pool: NodePool::new(budgets, Node::blank),
            bounds,
            last_recovery: None,
        }
    }

    fn sentinels(bounds: KeyBounds) -> (*mut Node<T>, *mut Node<T>, *mut Node<T>) {
        let head = Node::sentinel(bounds.min_key);
        let tail_one = Node::sentinel(bounds.max_key);
        let tail_two = Node::sentinel(bounds.max_key + 1);
        // SAFETY: all three sentinels were just allocated.
        unsafe {
            (*tail_one)
                .next
                .store(pack(tail_two, NodeState::Inserted.bits()), RELAXED);
            (*head)
                .next
                .store(pack(tail_one, NodeState::Inserted.bits()), RELAXED);
        }
        (head, tail_one, tail_two)
    }

    /// Sentinel configuration of this instance.
    #[must_use]
    pub fn bounds(&self) -> KeyBounds {
        self.bounds
    }

    /// CAS a node's state, preserving its successor pointer.
    unsafe fn state_cas(node: *mut Node<T>, old: NodeState, new: NodeState) -> bool {
        // SAFETY: caller guarantees `node` is a live pool node.
        unsafe {
            let successor = ptr_of::<Node<T>>((*node).next.load(READ_ORD), STATE_MASK);
            (*node)
                .next
                .compare_exchange(
                    pack(successor, old.bits()),
                    pack(successor, new.bits()),
                    CAS_SUCCESS,
                    CAS_FAILURE,
                )
                .is_ok()
        }
    }

    /// Unlink the node behind `cur_word`, preserving the predecessor-side
    /// state bits riding on the link.
    unsafe fn trim(&self, prev: *mut Node<T>, cur_word: usize) -> bool {
        let prev_state = tag_of(cur_word, STATE_MASK);
        // SAFETY: caller guarantees both nodes are reachable pool nodes.
        unsafe {
            let cur_ref = ptr_of::<Node<T>>(cur_word, STATE_MASK);
            let successor = ptr_of::<Node<T>>((*cur_ref).next.load(READ_ORD), STATE_MASK);
            (*prev)
                .next
                .compare_exchange(cur_word, pack(successor, prev_state), CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
        }
    }

    /// Walk to the first node with `node.key >= key` whose state is not
    /// `DELETED`, trimming `DELETED` nodes along the way.
    fn find(&self, key: i64) -> Found<T> {
        // SAFETY: nodes are never freed between recovers.
        unsafe {
            let mut prev = self.head;
            let mut cur_word = (*prev).next.load(READ_ORD);
            let mut cur_ref = ptr_of::<Node<T>>(cur_word, STATE_MASK);
            loop {
                let successor_word = (*cur_ref).next.load(READ_ORD);
                let cur_state = state_of(successor_word);
                if cur_state == NodeState::Deleted {
                    self.trim(prev, cur_word);
                } else {
                    if (*cur_ref).key >= key {
                        return Found {
                            prev,
                            cur_word,
                            cur_state,
                        };
                    }
                    prev = cur_ref;
                }
                cur_word = (*prev).next.load(READ_ORD);
                cur_ref = ptr_of(cur_word, STATE_MASK);
            }
        }
    }

    /// Bind the writer's next pool node to its current free cell and fill
    /// in the payload.
    fn alloc(&self, key: i64, item: T, writer: WriterId) -> Option<*mut Node<T>> {
        let node = self.pool.peek(writer as usize)?;
        let Some(index) = self.store.retrieve_address(writer) else {
            warn_log!(writer, "durable arena exhausted");
            return None;
        };
        // SAFETY: the peeked node is unpublished and owned by this writer.
        unsafe {
            (*node).pnode.addr = CellAddr::new(writer, index);
            (*node).key = key;
            (*node).item = item;
        }
        Some(node)
    }

    fn commit_alloc(&self, writer: WriterId) {
        self.pool.commit(writer as usize);
        self.store.update_address(writer);
    }

    /// Ascending keys at a quiescent point: nodes in state `INSERTED` or
    /// `INTEND_TO_DELETE`.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        let mut out = Vec::new();
        // SAFETY: quiescent walk between the sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), STATE_MASK);
            while cur != self.tail_one {
                let state = state_of((*cur).next.load(READ_ORD));
                if matches!(state, NodeState::Inserted | NodeState::IntendToDelete) {
                    out.push((*cur).key);
                }
                cur = ptr_of((*cur).next.load(READ_ORD), STATE_MASK);
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

    /// Keys of nodes not yet in state `DELETED`, sentinels excluded.
    fn volatile_snapshot(&self) -> Vec<i64> {
        let mut out = Vec::new();
        // SAFETY: quiescent walk between the sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), STATE_MASK);
            while cur != self.tail_one {
                if state_of((*cur).next.load(READ_ORD)) != NodeState::Deleted {
                    out.push((*cur).key);
                }
                cur = ptr_of((*cur).next.load(READ_ORD), STATE_MASK);
            }
        }
        out
    }

    /// Rebuild the list from the live cells of the durable arena.
    ///
    /// Callers must have quiesced all writers.
    pub fn recover(&mut self, budgets: &[usize]) {
        let recovered = self.store.read_reset();
        let report = RecoveryReport {
            volatile_keys: self.volatile_snapshot(),
            durable_keys: recovered.keys.clone(),
        };
        debug_log!(live = recovered.total(), "soft recover");

        // SAFETY: writers are quiesced; sentinels are exclusively owned and
        // the pool rebuild reclaims every other node.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail_one));
            drop(Box::from_raw(self.tail_two));
        }
        let sizes: Vec<usize> = budgets
            .iter()
            .zip(&recovered.per_writer)
            .map(|(&budget, &live)| budget + live)
            .collect();
        self.pool.rebuild(&sizes, Node::blank);
        let (head, tail_one, tail_two) = Self::sentinels(self.bounds);
        self.head = head;
        self.tail_one = tail_one;
        self.tail_two = tail_two;

        for i in 0..recovered.total() {
            let _ = DurableSet::insert(self, recovered.keys[i], recovered.items[i], recovered.writers[i]);
        }
        self.last_recovery = Some(report);
    }
}

impl<T: Copy + Default> DurableSet<T> for SoftSet<T> {
    fn insert(&self, key: i64, item: T, writer: WriterId) -> bool {
        let result_node;
        let result;
        loop {
            let found = self.find(key);
            let prev_state = tag_of(found.cur_word, STATE_MASK);
            // SAFETY: find returns reachable pool nodes or sentinels.
            unsafe {
                let cur_ref = ptr_of::<Node<T>>(found.cur_word, STATE_MASK);
                if (*cur_ref).key == key {
                    if found.cur_state != NodeState::IntendToInsert {
                        return false;
                    }
                    // Join the in-flight insert: no new node, but share the
                    // publishing work below.
                    result_node = cur_ref;
                    result = false;
                    break;
                }
                let Some(node) = self.alloc(key, item, writer) else {
                    return false; // No memory available
                };
                (*node)
                    .next
                    .store(pack(cur_ref, NodeState::IntendToInsert.bits()), RELAXED);
                if (*found.prev)
                    .next
                    .compare_exchange(
                        found.cur_word,
                        pack(node, prev_state),
                        CAS_SUCCESS,
                        CAS_FAILURE,
                    )
                    .is_ok()
                {
                    self.commit_alloc(writer);
                    result_node = node;
                    result = true;
                    break;
                }
            }
        }
        // Publishing phase: make the record durable, then promote. Any
        // thread seeing INTEND_TO_INSERT may perform the same promotion.
        // SAFETY: result_node is a reachable pool node.
        unsafe {
            (*result_node)
                .pnode
                .create((*result_node).key, (*result_node).item, &self.store);
            while state_of((*result_node).next.load(READ_ORD)) == NodeState::IntendToInsert {
                Self::state_cas(result_node, NodeState::IntendToInsert, NodeState::Inserted);
            }
        }
        result
    }

    fn remove(&self, key: i64, _writer: WriterId) -> bool {
        let found = self.find(key);
        // SAFETY: find returns reachable pool nodes or sentinels.
        unsafe {
            let cur_ref = ptr_of::<Node<T>>(found.cur_word, STATE_MASK);
            if (*cur_ref).key != key {
                return false;
            }
            if found.cur_state == NodeState::IntendToInsert {
                return false; // Not yet logically present
            }

            // The winner of INSERTED -> INTEND_TO_DELETE is the remover.
            let mut result = false;
            while !result && state_of((*cur_ref).next.load(READ_ORD)) == NodeState::Inserted {
                result = Self::state_cas(cur_ref, NodeState::Inserted, NodeState::IntendToDelete);
            }

            // Winner and helpers both persist the delete and finish the
            // state machine.
            (*cur_ref)
                .pnode
                .destroy((*cur_ref).key, (*cur_ref).item, &self.store);
            while state_of((*cur_ref).next.load(READ_ORD)) == NodeState::IntendToDelete {
                Self::state_cas(cur_ref, NodeState::IntendToDelete, NodeState::Deleted);
            }

            if result {
                self.trim(found.prev, found.cur_word);
            }
            result
        }
    }

    fn contains(&self, key: i64) -> bool {
        // SAFETY: traversal dereferences only pool nodes and sentinels.
        unsafe {
            let mut cur = ptr_of::<Node<T>>((*self.head).next.load(READ_ORD), STATE_MASK);
            while (*cur).key < key {
                cur = ptr_of((*cur).next.load(READ_ORD), STATE_MASK);
            }
            let state = state_of((*cur).next.load(READ_ORD));
            if (*cur).key != key {
                return false;
            }
            !matches!(state, NodeState::Deleted | NodeState::IntendToInsert)
        }
    }
}

impl<T: Copy + Default> Drop for SoftSet<T> {
    fn drop(&mut self) {
        // SAFETY: sentinels are exclusively owned at drop time.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail_one));
            drop(Box::from_raw(self.tail_two));
        }
    }
}
