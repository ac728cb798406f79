//! A worker deque with an owner-private spill-over stack.

use core::fmt;

use crate::deque::{Stealer, Worker};

/// A [`Worker`] that never rejects a task.
///
/// Pushes that the bounded deque turns away land on an unbounded LIFO
/// overflow stack. The stack belongs to the owner alone: thieves only ever
/// see the deque half, so spilled tasks take no part in load balancing
/// until the owner drains them.
///
/// # Examples
///
/// ```
/// use taskqueue::OverflowWorker;
///
/// let mut w = OverflowWorker::new(4);
/// for i in 0..4 {
///     w.save(i);
/// }
///
/// // Two tasks fit the deque; the rest spilled.
/// assert!(!w.overflow_is_empty());
///
/// // Spilled tasks come back first, newest first.
/// assert_eq!(w.retrieve(), Some(3));
/// assert_eq!(w.retrieve(), Some(2));
/// assert_eq!(w.retrieve(), Some(1));
/// assert_eq!(w.retrieve(), Some(0));
/// assert_eq!(w.retrieve(), None);
/// ```
pub struct OverflowWorker<T> {
    queue: Worker<T>,
    overflow: Vec<T>,
}

impl<T> OverflowWorker<T> {
    /// Creates an overflow-augmented deque; `capacity` is the deque's ring
    /// capacity, as for [`Worker::new`].
    pub fn new(capacity: usize) -> OverflowWorker<T> {
        OverflowWorker {
            queue: Worker::new(capacity),
            overflow: Vec::new(),
        }
    }

    /// Stores a task, preferring the stealable deque and spilling to the
    /// overflow stack when the deque is full.
    pub fn save(&mut self, task: T) {
        if let Err(task) = self.queue.push(task) {
            self.overflow.push(task);
        }
    }

    /// Takes a task back, draining the overflow stack before the deque.
    pub fn retrieve(&mut self) -> Option<T> {
        self.retrieve_from_overflow()
            .or_else(|| self.retrieve_from_queue())
    }

    /// Takes the youngest task from the stealable deque only.
    pub fn retrieve_from_queue(&mut self) -> Option<T> {
        self.queue.pop()
    }

    /// Takes the most recently spilled task from the overflow stack only.
    pub fn retrieve_from_overflow(&mut self) -> Option<T> {
        self.overflow.pop()
    }

    /// Returns `true` if both the deque and the overflow stack are empty.
    pub fn is_empty(&self) -> bool {
        self.queue_is_empty() && self.overflow_is_empty()
    }

    /// Returns `true` if the stealable deque is empty.
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` if the overflow stack is empty.
    pub fn overflow_is_empty(&self) -> bool {
        self.overflow.is_empty()
    }

    /// Returns the owner handle of the stealable deque.
    pub fn queue(&self) -> &Worker<T> {
        &self.queue
    }

    /// Creates a [`Stealer`] for the stealable deque.
    pub fn stealer(&self) -> Stealer<T> {
        self.queue.stealer()
    }
}

impl<T> fmt::Debug for OverflowWorker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("OverflowWorker { .. }")
    }
}
