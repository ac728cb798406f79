//! Distributed detection of global work exhaustion.

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::set::QueueSet;

/// Rounds spent yielding before the detector falls back to sleeping.
const YIELD_ROUNDS: u32 = 20;

/// How long each post-yield round sleeps.
const SLEEP_INTERVAL: Duration = Duration::from_millis(1);

/// The host-scheduler hooks the detector waits with.
///
/// The default [`ThreadIdle`] defers to the OS scheduler. Tests and
/// embedders with their own scheduling substitute an implementation of
/// their own, which also makes termination runs reproducible.
pub trait Idle {
    /// Gives up the CPU briefly without blocking.
    fn yield_now(&mut self);

    /// Blocks for roughly `dur`.
    fn sleep(&mut self, dur: Duration);
}

/// [`Idle`] backed by `std::thread`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadIdle;

impl Idle for ThreadIdle {
    fn yield_now(&mut self) {
        std::thread::yield_now();
    }

    fn sleep(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Lets a fleet of workers agree that no task is left anywhere.
///
/// Each worker that runs out of local and stolen work calls
/// [`offer_termination`]. The offer either completes, proving that every
/// worker was simultaneously idle over empty queues, or aborts because
/// some queue became non-empty, in which case the worker goes back to
/// stealing.
///
/// A worker must not push or hold unfinished tasks while it has an offer
/// outstanding; the consensus counts on offering workers being truly idle.
///
/// [`offer_termination`]: Terminator::offer_termination
pub struct Terminator {
    /// Number of workers participating in the consensus.
    threads: usize,

    /// How many workers currently have an offer outstanding.
    offered: AtomicUsize,
}

impl Terminator {
    /// Creates a detector for a fleet of `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    pub fn new(threads: usize) -> Terminator {
        assert!(threads >= 1, "a terminator needs at least one thread");
        Terminator {
            threads,
            offered: AtomicUsize::new(0),
        }
    }

    /// Offers to terminate, waiting with the default [`ThreadIdle`].
    ///
    /// Returns `true` once all `threads` workers are offering at once; the
    /// whole fleet then returns `true` and may stop. Returns `false` as
    /// soon as any deque in `queues` is seen holding work; the caller
    /// should go steal and offer again when it runs dry.
    pub fn offer_termination<T>(&self, queues: &QueueSet<T>) -> bool {
        self.offer_termination_with(queues, &mut ThreadIdle)
    }

    /// Like [`offer_termination`](Terminator::offer_termination) with a
    /// caller-supplied [`Idle`].
    pub fn offer_termination_with<T, I: Idle>(&self, queues: &QueueSet<T>, idle: &mut I) -> bool {
        if self.offered.fetch_add(1, Ordering::SeqCst) + 1 == self.threads {
            return true;
        }

        let mut rounds = 0;
        loop {
            if self.offered.load(Ordering::SeqCst) == self.threads {
                return true;
            }

            if rounds < YIELD_ROUNDS {
                idle.yield_now();
            } else {
                idle.sleep(SLEEP_INTERVAL);
            }
            rounds += 1;

            if queues.peek() {
                // Work appeared somewhere; withdraw the offer and go take
                // it. A worker that pushed that work cannot itself reach
                // consensus before its queue drains, so withdrawing here
                // never loses a wakeup.
                self.offered.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
        }
    }

    /// Makes the detector reusable for another round.
    ///
    /// The caller must ensure no worker still has an offer outstanding.
    pub fn reset_for_reuse(&self) {
        self.offered.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Terminator { .. }")
    }
}
