//! A directory of deques that coordinates victim selection for stealing.

use core::fmt;

use crate::deque::Stealer;
use crate::rng;

/// How a thief picks its victim for one steal attempt.
///
/// Every variant skips the thief's own queue. With two queues they all
/// degenerate to "try the other one", and with a single queue stealing
/// always fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StealPolicy {
    /// One victim, chosen uniformly at random.
    RandomOne,
    /// Two distinct random victims; raid whichever queue is longer, with
    /// ties going to the first.
    #[default]
    BestOfTwo,
    /// Scan every queue and raid the longest non-empty one.
    BestOfAll,
}

/// A fixed-size set of deques, indexed by worker number.
///
/// Each worker registers the [`Stealer`] for its own deque at its index
/// before the fleet starts running; registration requires exclusive access
/// and the mapping is immutable afterwards.
///
/// # Examples
///
/// ```
/// use taskqueue::{QueueSet, Worker};
///
/// let a = Worker::new(16);
/// let b = Worker::new(16);
///
/// let mut set = QueueSet::new(2);
/// set.register(0, a.stealer());
/// set.register(1, b.stealer());
///
/// a.push("task").unwrap();
/// assert!(set.peek());
///
/// let mut seed = 7;
/// assert_eq!(set.steal(1, &mut seed), Some("task"));
/// assert_eq!(set.steal(1, &mut seed), None);
/// ```
pub struct QueueSet<T> {
    queues: Vec<Option<Stealer<T>>>,
}

impl<T> QueueSet<T> {
    /// Creates a set with `n` unregistered slots.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn new(n: usize) -> QueueSet<T> {
        assert!(n >= 1, "a queue set needs at least one queue");
        QueueSet {
            queues: (0..n).map(|_| None).collect(),
        }
    }

    /// Installs the deque for worker `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn register(&mut self, index: usize, stealer: Stealer<T>) {
        assert!(
            index < self.queues.len(),
            "queue index {} out of range for a set of {}",
            index,
            self.queues.len()
        );
        self.queues[index] = Some(stealer);
    }

    /// Returns the stealer registered for worker `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot was never registered.
    pub fn stealer(&self, index: usize) -> &Stealer<T> {
        self.queues[index].as_ref().expect("queue not registered")
    }

    /// Returns the number of queue slots in the set.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Returns `true` if any registered deque appears non-empty.
    ///
    /// An optimistic witness, not a linearizable snapshot: a `true` may be
    /// stale by the time the caller acts on it, and the termination
    /// protocol is what turns a stable `false` into a real guarantee.
    pub fn peek(&self) -> bool {
        self.queues.iter().flatten().any(|queue| !queue.is_empty())
    }

    /// Tries to steal one task for the worker at `index`, using the
    /// default best-of-two policy.
    ///
    /// Makes up to `2 * queue_count()` attempts and returns the first
    /// success. `None` means every attempt failed, not that the set is
    /// empty. `seed` is the caller-owned random state; give every worker
    /// its own non-zero seed.
    pub fn steal(&self, index: usize, seed: &mut u32) -> Option<T> {
        self.steal_with(StealPolicy::BestOfTwo, index, seed)
    }

    /// Like [`steal`](QueueSet::steal) with an explicit victim-selection
    /// policy.
    pub fn steal_with(&self, policy: StealPolicy, index: usize, seed: &mut u32) -> Option<T> {
        for _ in 0..2 * self.queue_count() {
            let stolen = match policy {
                StealPolicy::RandomOne => self.steal_one_random(index, seed),
                StealPolicy::BestOfTwo => self.steal_best_of_two(index, seed),
                StealPolicy::BestOfAll => self.steal_best_of_all(index),
            };
            if stolen.is_some() {
                return stolen;
            }
        }
        None
    }

    /// Picks a random victim index distinct from `index`.
    fn victim(&self, index: usize, seed: &mut u32) -> usize {
        let n = self.queues.len();
        let mut k = index;
        while k == index {
            k = rng::park_miller(seed) as usize % n;
        }
        k
    }

    fn steal_one_random(&self, index: usize, seed: &mut u32) -> Option<T> {
        match self.queue_count() {
            1 => None,
            2 => self.stealer((index + 1) % 2).steal(),
            _ => self.stealer(self.victim(index, seed)).steal(),
        }
    }

    fn steal_best_of_two(&self, index: usize, seed: &mut u32) -> Option<T> {
        match self.queue_count() {
            1 => None,
            2 => self.stealer((index + 1) % 2).steal(),
            _ => {
                let k1 = self.victim(index, seed);
                let mut k2 = self.victim(index, seed);
                while k2 == k1 {
                    k2 = self.victim(index, seed);
                }
                if self.stealer(k2).len() > self.stealer(k1).len() {
                    self.stealer(k2).steal()
                } else {
                    self.stealer(k1).steal()
                }
            }
        }
    }

    fn steal_best_of_all(&self, index: usize) -> Option<T> {
        match self.queue_count() {
            1 => None,
            2 => self.stealer((index + 1) % 2).steal(),
            _ => {
                let mut best: Option<(usize, usize)> = None;
                for (k, queue) in self.queues.iter().enumerate() {
                    if k == index {
                        continue;
                    }
                    let len = queue.as_ref().expect("queue not registered").len();
                    if len > 0 && best.map_or(true, |(_, best_len)| len > best_len) {
                        best = Some((k, len));
                    }
                }
                best.and_then(|(k, _)| self.stealer(k).steal())
            }
        }
    }
}

impl<T> fmt::Debug for QueueSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("QueueSet { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueSet, StealPolicy};
    use crate::deque::Worker;

    fn set_of(workers: &[Worker<usize>]) -> QueueSet<usize> {
        let mut set = QueueSet::new(workers.len());
        for (i, w) in workers.iter().enumerate() {
            set.register(i, w.stealer());
        }
        set
    }

    #[test]
    fn register_and_lookup() {
        let workers: Vec<Worker<usize>> = (0..3).map(|_| Worker::new(16)).collect();
        let set = set_of(&workers);
        assert_eq!(set.queue_count(), 3);

        workers[2].push(5).unwrap();
        assert_eq!(set.stealer(2).len(), 1);
        assert_eq!(set.stealer(0).len(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn register_out_of_range() {
        let w: Worker<usize> = Worker::new(16);
        let mut set = QueueSet::new(2);
        set.register(2, w.stealer());
    }

    #[test]
    fn peek_sees_any_queue() {
        let workers: Vec<Worker<usize>> = (0..4).map(|_| Worker::new(16)).collect();
        let set = set_of(&workers);
        assert!(!set.peek());

        workers[3].push(1).unwrap();
        assert!(set.peek());

        assert_eq!(workers[3].pop(), Some(1));
        assert!(!set.peek());
    }

    #[test]
    fn single_queue_never_steals() {
        let w: Worker<usize> = Worker::new(16);
        let mut set = QueueSet::new(1);
        set.register(0, w.stealer());
        w.push(1).unwrap();

        let mut seed = 1;
        for policy in [
            StealPolicy::RandomOne,
            StealPolicy::BestOfTwo,
            StealPolicy::BestOfAll,
        ] {
            assert_eq!(set.steal_with(policy, 0, &mut seed), None);
        }
        assert_eq!(w.pop(), Some(1));
    }

    #[test]
    fn two_queues_try_the_other_one() {
        for policy in [
            StealPolicy::RandomOne,
            StealPolicy::BestOfTwo,
            StealPolicy::BestOfAll,
        ] {
            let workers: Vec<Worker<usize>> = (0..2).map(|_| Worker::new(16)).collect();
            let set = set_of(&workers);
            workers[0].push(10).unwrap();

            let mut seed = 1;
            assert_eq!(set.steal_with(policy, 1, &mut seed), Some(10));
            // The thief's own queue is never a victim.
            workers[1].push(11).unwrap();
            assert_eq!(set.steal_with(policy, 1, &mut seed), None);
            assert_eq!(workers[1].pop(), Some(11));
        }
    }

    #[test]
    fn steal_drains_a_loaded_victim() {
        let workers: Vec<Worker<usize>> = (0..4).map(|_| Worker::new(256)).collect();
        let set = set_of(&workers);
        for i in 0..100 {
            workers[0].push(i).unwrap();
        }

        let mut seed = 42;
        let mut stolen = Vec::new();
        for _ in 0..100_000 {
            if stolen.len() == 100 {
                break;
            }
            if let Some(task) = set.steal(1, &mut seed) {
                stolen.push(task);
            }
        }
        // A lone thief over idle victims sees the owner's push order.
        assert_eq!(stolen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn best_of_all_prefers_the_longest() {
        let workers: Vec<Worker<usize>> = (0..4).map(|_| Worker::new(64)).collect();
        let set = set_of(&workers);

        workers[1].push(1).unwrap();
        for i in 0..10 {
            workers[2].push(100 + i).unwrap();
        }

        let mut seed = 1;
        assert_eq!(
            set.steal_with(StealPolicy::BestOfAll, 0, &mut seed),
            Some(100)
        );
    }

    #[test]
    fn random_one_steals_from_the_computed_victim() {
        // Load every queue but the thief's; wherever the random choice
        // lands, the steal must come from that victim, so repeated rounds
        // drain all of them.
        let workers: Vec<Worker<usize>> = (0..4).map(|_| Worker::new(16)).collect();
        let set = set_of(&workers);
        for (i, w) in workers.iter().enumerate().skip(1) {
            w.push(i).unwrap();
        }

        let mut seed = 123;
        let mut stolen = Vec::new();
        for _ in 0..100_000 {
            if stolen.len() == 3 {
                break;
            }
            if let Some(task) = set.steal_with(StealPolicy::RandomOne, 0, &mut seed) {
                stolen.push(task);
            }
        }
        stolen.sort_unstable();
        assert_eq!(stolen, vec![1, 2, 3]);
    }
}
