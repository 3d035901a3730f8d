//! Multi-resource lock.
//!
//! [`MrLock`] protects up to 32 numbered resources at once. A request names
//! the resources it needs as a bitmask; it is admitted when no earlier
//! still-held request's mask intersects it. Requests are queued in a ring
//! of sequenced cells, which gives FIFO admission and freedom from
//! starvation under bounded contention, while any two pairwise-disjoint
//! masks proceed concurrently.
//!
//! # Usage
//!
//! ```rust
//! use duraset::mrlock::MrLock;
//!
//! let lock = MrLock::new(16);
//! let guard = lock.lock(0b0110);
//! // resources 1 and 2 are held until `guard` drops
//! drop(guard);
//! ```
//!
//! # Queue discipline
//!
//! Each ring cell carries a sequence number and the enqueued mask. A
//! requester claims the next tail position, waits for its cell to be armed
//! for that position, publishes its mask, then scans forward from the head:
//! a cell is passed once it is dequeued (sequence advanced past its
//! position) or its mask is disjoint. Unenqueued and dequeued cells hold
//! the all-ones mask, so a scanner conservatively blocks until the real
//! mask is published.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, AtomicUsize};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Mask value for cells with no published request; conflicts with all.
const BLOCK_ALL: u32 = u32::MAX;

struct Cell {
    /// Ring position this cell is armed for.
    seq: AtomicUsize,
    /// Published resource mask, or [`BLOCK_ALL`].
    bits: AtomicU32,
}

/// FIFO bitmask lock over up to 32 resources.
pub struct MrLock {
    buffer: Box<[Cell]>,
    /// `buffer.len() - 1`; the ring length is a power of two.
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

/// Proof that a mask is held; releases it on drop.
#[must_use = "dropping the guard releases the resources"]
pub struct MrGuard<'a> {
    lock: &'a MrLock,
    pos: usize,
}

impl Drop for MrGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.pos);
    }
}

impl MrLock {
    /// Create a lock whose request queue holds `capacity` entries.
    ///
    /// `capacity` is rounded up to a power of two and must exceed the
    /// maximum number of simultaneously outstanding requests (holders plus
    /// waiters), or late requesters spin until a slot recycles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let len = capacity.next_power_of_two().max(4);
        let buffer = (0..len)
            .map(|i| Cell {
                seq: AtomicUsize::new(i),
                bits: AtomicU32::new(BLOCK_ALL),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: len - 1,
            buffer,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Acquire all resources in `resources` (must be non-zero).
    ///
    /// Blocks (spinning) until every earlier conflicting request has been
    /// released. Admission is FIFO over enqueue order.
    pub fn lock(&self, resources: u32) -> MrGuard<'_> {
        debug_assert_ne!(resources, 0, "empty resource mask");

        let pos = self.tail.fetch_add(1, CAS_SUCCESS);
        let cell = &self.buffer[pos & self.mask];

        // Wait for the slot to be recycled for our position.
        while cell.seq.load(READ_ORD) != pos {
            spin_loop();
        }
        cell.bits.store(resources, WRITE_ORD);

        // Admitted once every earlier request is dequeued or disjoint.
        let mut spin = self.head.load(READ_ORD);
        while spin != pos {
            let earlier = &self.buffer[spin & self.mask];
            if earlier.seq.load(READ_ORD) > spin || earlier.bits.load(READ_ORD) & resources == 0 {
                spin += 1;
            } else {
                spin_loop();
            }
        }
        MrGuard { lock: self, pos }
    }

    fn release(&self, pos: usize) {
        self.buffer[pos & self.mask].bits.store(0, WRITE_ORD);

        // Retire every released entry at the head so scanners pass it.
        let mut head = self.head.load(READ_ORD);
        while self.buffer[head & self.mask].bits.load(READ_ORD) == 0 {
            let slot = &self.buffer[head & self.mask];
            if self
                .head
                .compare_exchange(head, head + 1, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                slot.bits.store(BLOCK_ALL, RELAXED);
                slot.seq.store(head + self.buffer.len(), WRITE_ORD);
            }
            head = self.head.load(READ_ORD);
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "fail fast in tests")]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_unlock_single_thread() {
        let lock = MrLock::new(4);
        for _ in 0..64 {
            // Wraps the ring many times over.
            drop(lock.lock(0b1));
        }
    }

    #[test]
    fn nested_disjoint_masks_coexist() {
        let lock = MrLock::new(8);
        let a = lock.lock(0b01);
        let b = lock.lock(0b10);
        drop(a);
        drop(b);
    }

    #[test]
    fn disjoint_masks_admit_concurrently() {
        let lock = Arc::new(MrLock::new(8));
        let held = lock.lock(0b01);

        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let guard = other.lock(0b10);
            tx.send(()).unwrap();
            drop(guard);
        });

        // The disjoint request must get in while we still hold ours.
        rx.recv_timeout(Duration::from_secs(5))
            .expect("disjoint mask was not admitted");
        drop(held);
        handle.join().unwrap();
    }

    #[test]
    fn conflicting_masks_are_mutually_exclusive() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 500;

        let lock = Arc::new(MrLock::new(16));
        let in_critical = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let in_critical = Arc::clone(&in_critical);
                let entries = Arc::clone(&entries);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let guard = lock.lock(0b100);
                        assert!(!in_critical.swap(true, Ordering::SeqCst));
                        entries.fetch_add(1, Ordering::Relaxed);
                        in_critical.store(false, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::Relaxed), THREADS * ROUNDS);
    }

    #[test]
    fn overlapping_pair_serializes_with_disjoint_traffic() {
        let lock = Arc::new(MrLock::new(16));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    // Threads 0 and 1 conflict on bit 0; thread 2 is disjoint.
                    let mask = if i == 2 { 0b1000 } else { 0b0011 };
                    for _ in 0..200 {
                        let guard = lock.lock(mask);
                        counter.fetch_add(1, Ordering::Relaxed);
                        drop(guard);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 600);
    }
}
