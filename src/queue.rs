//! A bounded lock-free MPMC FIFO Queue
//!
//! The Queue is a linked List of Nodes, that are taken from a
//! [`ConcurrentPool`] and linked together using [`TaggedIndex`]es. The first
//! Node of the List is always a Dummy, the actual Values are stored in the
//! Nodes after it. Popping a Value turns the Node that held it into the new
//! Dummy.
//!
//! Every Node has to be released twice before it can go back into the Pool:
//! once when its Value has been moved out and once when it has been unlinked
//! as the Dummy. These two happen on different Threads in an arbitrary order,
//! so whoever releases a Node second returns it to the Pool.
//!
//! # Example
//! ```rust
//! # use memsync::queue::ConcurrentQueue;
//! let queue = ConcurrentQueue::new(16).unwrap();
//!
//! queue.push(13).unwrap();
//! assert_eq!(Some(13), queue.try_pop());
//! assert_eq!(None, queue.try_pop());
//! ```
//!
//! # Reference:
//! * [Simple, Fast, and Practical Non-Blocking and Blocking Concurrent Queue Algorithms](https://www.cs.rochester.edu/u/scott/papers/1996_PODC_queues.pdf)

#[cfg(feature = "async")]
mod async_queue;
#[cfg(feature = "async")]
pub use async_queue::{AsyncQueue, PopFuture};

use std::{
    cell::UnsafeCell,
    fmt::Debug,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::ConfigError,
    pool::{ConcurrentPool, MAX_CAPACITY},
    tagged::{AtomicTaggedIndex, TaggedIndex, NULL_INDEX},
};

struct Node<T> {
    next: AtomicTaggedIndex,
    value: UnsafeCell<MaybeUninit<T>>,
    /// Set by the first of the two Releases of the Node
    released: AtomicBool,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            next: AtomicTaggedIndex::new(TaggedIndex::NULL),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            released: AtomicBool::new(false),
        }
    }
}

/// The lock-free Queue
///
/// # Dropping
/// A Queue should be emptied, using [`clear`](ConcurrentQueue::clear) or by
/// popping every Value, before it is dropped. Values that are still queued
/// at that Point are dropped in FIFO Order and a Warning is logged, instead
/// of panicking inside of `Drop`.
pub struct ConcurrentQueue<T> {
    nodes: ConcurrentPool<Node<T>>,
    head: AtomicTaggedIndex,
    tail: AtomicTaggedIndex,
    capacity: usize,
}

impl<T> ConcurrentQueue<T> {
    /// Creates a new empty Queue that can hold up to `capacity` Values at
    /// the same Time
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let node_count = capacity
            .checked_add(1)
            .filter(|count| *count <= MAX_CAPACITY)
            .ok_or(ConfigError::CapacityOverflow {
                requested: capacity,
                max: MAX_CAPACITY - 1,
            })?;

        let nodes = ConcurrentPool::new_with(node_count, |_| Node::empty())?;

        let dummy = match nodes.allocate() {
            Some(index) => index,
            None => unreachable!("the node pool has room for at least the dummy"),
        };
        // The Dummy never held a Value, so it only needs to be unlinked
        if let Some(node) = nodes.get(dummy) {
            node.released.store(true, Ordering::Relaxed);
        }

        let start = TaggedIndex::new(dummy, 0);

        Ok(Self {
            nodes,
            head: AtomicTaggedIndex::new(start),
            tail: AtomicTaggedIndex::new(start),
            capacity,
        })
    }

    fn node(&self, index: u32) -> &Node<T> {
        match self.nodes.get(index) {
            Some(node) => node,
            None => unreachable!("queue links only ever point into its own pool"),
        }
    }

    /// Releases the Node once, returning it to the Pool on the second Call
    fn release(&self, index: u32) {
        let node = self.node(index);
        if !node.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.nodes.deallocate(index) {
            log::error!("Releasing queue node {}: {}", index, e);
        }
    }

    /// Appends the Value to the End of the Queue
    ///
    /// # Returns
    /// * `Ok(())` if the Value was enqueued
    /// * `Err(value)` if no Node was available to hold the Value
    pub fn push(&self, value: T) -> Result<(), T> {
        let index = match self.nodes.allocate() {
            Some(index) => index,
            None => {
                log::debug!("Queue node pool exhausted");
                return Err(value);
            }
        };

        let node = self.node(index);
        // # Safety:
        // We just allocated the Node, so no other Thread is accessing its
        // Value until it gets linked into the Queue
        unsafe { (*node.value.get()).as_mut_ptr().write(value) };
        node.released.store(false, Ordering::Relaxed);
        let previous = node.next.load(Ordering::Relaxed);
        node.next
            .store(previous.with_index(NULL_INDEX), Ordering::Relaxed);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_node = self.node(tail.index());
            let next = tail_node.next.load(Ordering::Acquire);

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if !next.is_null() {
                // The Tail lags behind a completed Push, help move it forward
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.with_index(next.index()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            if tail_node
                .next
                .compare_exchange(
                    next,
                    next.with_index(index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The Push is complete, if this fails another Thread already
                // moved the Tail for us
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.with_index(index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Ok(());
            }
        }
    }

    /// Attempts to remove the Value at the Front of the Queue, without
    /// blocking
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = self.node(head.index()).next.load(Ordering::Acquire);

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head.index() == tail.index() {
                if next.is_null() {
                    return None;
                }

                let _ = self.tail.compare_exchange(
                    tail,
                    tail.with_index(next.index()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            if next.is_null() {
                // Inconsistent Snapshot, the Head moved in the meantime
                continue;
            }

            if self
                .head
                .compare_exchange(
                    head,
                    head.with_index(next.index()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            // # Safety:
            // Winning the CAS gives us the sole right to move the Value out.
            // The Node can't be reused until we release it below
            let value = unsafe { (*self.node(next.index()).value.get()).as_ptr().read() };

            self.release(head.index());
            self.release(next.index());

            return Some(value);
        }
    }

    /// Removes the Value at the Front of the Queue, spinning until one
    /// becomes available
    pub fn pop(&self) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Checks if the Queue is currently empty
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        self.node(head.index())
            .next
            .load(Ordering::Acquire)
            .is_null()
    }

    /// Counts the Values by walking the List.
    ///
    /// This is only a diagnostic and the result is meaningless while other
    /// Threads modify the Queue
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut current = self.head.load(Ordering::Acquire).index();

        while count <= self.capacity {
            let next = self.node(current).next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            count += 1;
            current = next.index();
        }

        count
    }

    /// Pops Values until the Queue is empty, dropping all of them
    pub fn clear(&self) {
        while self.try_pop().is_some() {}
    }

    /// The maximum Number of Values the Queue can hold at once
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// # Safety:
// Values are moved into the Queue by one Thread and moved out by exactly one
// other Thread, which is the same as sending them
unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
// # Safety:
// The Values are never accessed through a shared Reference, only moved in
// and out of the Queue
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

impl<T> Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConcurrentQueue<{}> (capacity: {})",
            std::any::type_name::<T>(),
            self.capacity
        )
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        let mut remaining = 0;
        while self.try_pop().is_some() {
            remaining += 1;
        }

        if remaining > 0 {
            log::warn!("Dropped a queue that still held {} values", remaining);
        }
    }
}
