//! Bounded work-stealing task queues for parallel worker pools.
//!
//! The typical setup is a fleet of threads, each owning one bounded deque.
//! A worker pushes freshly discovered tasks onto the bottom of its own
//! deque and pops them back off the same end, so the hottest tasks stay in
//! cache. When its deque runs dry, the worker turns thief: it consults a
//! shared [`QueueSet`] and takes the *oldest* task from the top of some
//! victim's deque. When the whole fleet runs dry, a [`Terminator`] lets the
//! workers agree that no task is left anywhere before they stop.
//!
//! # Queues
//!
//! [`Worker`] is the owner handle of a deque: only it may [`push`] and
//! [`pop`], and it is deliberately not [`Sync`]. [`stealer()`] hands out a
//! [`Stealer`] for the same deque, which may be cloned and shared freely;
//! stealers take tasks from the end opposite the owner.
//!
//! Every deque has a fixed power-of-two capacity chosen at construction.
//! A full deque rejects the push and hands the task back; hosts that must
//! never drop tasks can wrap the owner handle in an [`OverflowWorker`],
//! which spills rejected tasks to an owner-private unbounded stack.
//!
//! # Stealing
//!
//! A [`QueueSet`] maps worker indexes to stealers, set up once before the
//! workers start. [`QueueSet::steal`] picks victims at random (two at a
//! time, raiding the longer queue) and retries a bounded number of times;
//! other selection strategies are available through [`StealPolicy`].
//! Steal attempts fail spuriously under contention, so a failed round is
//! no proof the set is empty; proving global emptiness is the
//! [`Terminator`]'s job.
//!
//! # Example
//!
//! ```
//! use taskqueue::{QueueSet, Terminator, Worker};
//!
//! // One deque per worker, registered in a shared set.
//! let workers: Vec<Worker<u32>> = (0..2).map(|_| Worker::new(16)).collect();
//! let mut set = QueueSet::new(2);
//! for (i, w) in workers.iter().enumerate() {
//!     set.register(i, w.stealer());
//! }
//!
//! // Local pushes and pops are owner-only; everything else steals.
//! workers[0].push(1).unwrap();
//! workers[0].push(2).unwrap();
//!
//! let mut seed = 42;
//! assert_eq!(set.steal(1, &mut seed), Some(1));
//! assert_eq!(workers[0].pop(), Some(2));
//!
//! // With every queue drained, the fleet agrees to stop.
//! let terminator = Terminator::new(1);
//! assert!(terminator.offer_termination(&set));
//! ```
//!
//! [`push`]: Worker::push
//! [`pop`]: Worker::pop
//! [`stealer()`]: Worker::stealer

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod deque;
mod overflow;
mod rng;
mod set;
mod termination;

pub use crate::deque::{Stealer, Worker, DEFAULT_CAPACITY};
pub use crate::overflow::OverflowWorker;
pub use crate::set::{QueueSet, StealPolicy};
pub use crate::termination::{Idle, Terminator, ThreadIdle};
