//! The bounded lock-free deque underneath every worker.
//!
//! One thread owns the bottom end through a [`Worker`] handle; any number
//! of threads take from the top end through cloned [`Stealer`] handles.
//! Races between the owner and thieves over the last remaining task are
//! resolved by a single compare-and-swap on a packed `(top, tag)` word.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{self, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// The capacity most hosts want: 2^14 slots per worker.
pub const DEFAULT_CAPACITY: usize = 1 << 14;

/// The packed `(top, tag)` control word.
///
/// `top` indexes the oldest task in the ring. `tag` counts the events that
/// recycle `top` values: owner-side canonicalization of a contested empty
/// queue, and `top` wrapping past zero. Replacing both halves with one CAS
/// keeps a stale `(top, tag)` pair from ever matching again, which is all
/// the ABA protection this structure needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Age {
    top: u32,
    tag: u32,
}

impl Age {
    fn pack(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.top)
    }

    fn unpack(bits: u64) -> Age {
        Age {
            top: bits as u32,
            tag: (bits >> 32) as u32,
        }
    }
}

/// A slot in the ring. Only slots inside `[top, bottom)` hold live tasks;
/// the rest hold stale bits that must not be observed.
struct Slot<T> {
    task: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Slot<T> {
        Slot {
            task: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

struct Inner<T> {
    /// Index of the first free slot after the last pushed task.
    /// Written only by the owner.
    bottom: CachePadded<AtomicU32>,

    /// The packed `(top, tag)` word, always read and replaced whole.
    age: CachePadded<AtomicU64>,

    /// The ring of `capacity` slots.
    buffer: Box<[Slot<T>]>,

    /// `capacity - 1`, for index arithmetic modulo the capacity.
    mask: u32,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new(capacity: usize) -> Inner<T> {
        assert!(
            capacity.is_power_of_two(),
            "capacity must be a power of two"
        );
        assert!(capacity >= 4, "capacity must be at least 4");
        assert!(capacity <= 1 << 31, "capacity must be at most 2^31");

        Inner {
            bottom: CachePadded::new(AtomicU32::new(0)),
            age: CachePadded::new(AtomicU64::new(0)),
            buffer: (0..capacity).map(|_| Slot::new()).collect(),
            mask: (capacity - 1) as u32,
        }
    }

    fn capacity(&self) -> u32 {
        self.mask.wrapping_add(1)
    }

    /// Capacity minus two: one slot disambiguates full from empty, and one
    /// more absorbs the contested-pop window.
    fn max_len(&self) -> u32 {
        self.capacity() - 2
    }

    fn inc(&self, index: u32) -> u32 {
        index.wrapping_add(1) & self.mask
    }

    fn dec(&self, index: u32) -> u32 {
        index.wrapping_sub(1) & self.mask
    }

    /// Distance from `top` around the ring to `bot`, in `[0, capacity)`.
    ///
    /// The value `capacity - 1` is the transient encoding of an empty
    /// queue, left behind while the owner's speculative bottom decrement
    /// races a thief's top increment.
    fn dirty_len(&self, bot: u32, top: u32) -> u32 {
        bot.wrapping_sub(top) & self.mask
    }

    /// Like [`dirty_len`](Inner::dirty_len) with the transient empty
    /// encoding mapped to zero.
    fn len(&self, bot: u32, top: u32) -> u32 {
        let len = self.dirty_len(bot, top);
        if len == self.mask {
            0
        } else {
            len
        }
    }

    fn load_age(&self, order: Ordering) -> Age {
        Age::unpack(self.age.load(order))
    }

    fn cas_age(&self, old: Age, new: Age) -> bool {
        self.age
            .compare_exchange(old.pack(), new.pack(), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Reads the task out of a slot.
    ///
    /// # Safety
    ///
    /// The slot must lie in `[top, bottom)` at the time of the call, and
    /// the caller must either win the claim that covers the slot or
    /// `mem::forget` the result.
    unsafe fn read(&self, index: u32) -> T {
        debug_assert!((index as usize) < self.buffer.len());
        (*self.buffer.get_unchecked(index as usize).task.get()).assume_init_read()
    }

    /// Writes a task into a slot outside `[top, bottom)`.
    ///
    /// # Safety
    ///
    /// Owner-only, and the slot must be free.
    unsafe fn write(&self, index: u32, task: T) {
        debug_assert!((index as usize) < self.buffer.len());
        (*self.buffer.get_unchecked(index as usize).task.get()).write(task);
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            let bottom = *self.bottom.get_mut();
            let age = Age::unpack(*self.age.get_mut());
            let len = self.len(bottom, age.top);

            let mut index = age.top;
            for _ in 0..len {
                unsafe {
                    (*self.buffer[index as usize].task.get()).assume_init_drop();
                }
                index = self.inc(index);
            }
        }
    }
}

/// The owner handle of a deque.
///
/// Only the thread holding the `Worker` may push and pop; it works at the
/// bottom end, so local pops come back in LIFO order. The handle can be
/// sent to another thread but not shared between threads.
///
/// # Examples
///
/// ```
/// use taskqueue::Worker;
///
/// let w = Worker::new(16);
/// w.push('a').unwrap();
/// w.push('b').unwrap();
/// assert_eq!(w.pop(), Some('b'));
/// assert_eq!(w.pop(), Some('a'));
/// assert_eq!(w.pop(), None);
/// ```
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
    /// Owner operations are single-threaded; this keeps the handle out of
    /// `Sync` so the compiler enforces it.
    _marker: PhantomData<*mut ()>,
}

unsafe impl<T: Send> Send for Worker<T> {}

impl<T> Worker<T> {
    /// Creates a deque with room for `capacity - 2` tasks.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two in `[4, 2^31]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskqueue::{Worker, DEFAULT_CAPACITY};
    ///
    /// let w: Worker<usize> = Worker::new(DEFAULT_CAPACITY);
    /// assert_eq!(w.capacity(), DEFAULT_CAPACITY);
    /// ```
    pub fn new(capacity: usize) -> Worker<T> {
        Worker {
            inner: Arc::new(Inner::new(capacity)),
            _marker: PhantomData,
        }
    }

    /// Creates a [`Stealer`] for the other end of this deque.
    ///
    /// Stealers may be cloned and handed to any number of threads.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Pushes a task onto the bottom of the deque.
    ///
    /// Fails iff the deque is full, handing the task back to the caller.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskqueue::Worker;
    ///
    /// let w = Worker::new(4);
    /// assert_eq!(w.push(1), Ok(()));
    /// assert_eq!(w.push(2), Ok(()));
    /// assert_eq!(w.push(3), Err(3));
    /// ```
    pub fn push(&self, task: T) -> Result<(), T> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let top = inner.load_age(Ordering::Acquire).top;
        let dirty = inner.dirty_len(b, top);

        // `capacity - 1` is the transient empty encoding: the slot is in
        // fact free, so the push proceeds.
        if dirty < inner.max_len() || dirty == inner.capacity() - 1 {
            unsafe {
                inner.write(b, task);
            }
            // Publish the slot before the new bottom, so a thief that
            // observes the new bottom also observes the task.
            inner.bottom.store(inner.inc(b), Ordering::Release);
            Ok(())
        } else {
            Err(task)
        }
    }

    /// Pops the youngest task off the bottom of the deque.
    ///
    /// Returns `None` iff the deque is empty.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let dirty = inner.dirty_len(b, inner.load_age(Ordering::Acquire).top);
        // Only this method creates the transient encoding, and it always
        // canonicalizes before returning.
        debug_assert!(dirty != inner.capacity() - 1);
        if dirty == 0 {
            return None;
        }

        // Speculatively claim the bottom slot.
        let b = inner.dec(b);
        inner.bottom.store(b, Ordering::Relaxed);

        // The store of `bottom` must be ordered before the reload of
        // `age`; neither release nor acquire alone orders a store before
        // a later load.
        atomic::fence(Ordering::SeqCst);

        let task = unsafe { inner.read(b) };

        let age = inner.load_age(Ordering::Acquire);
        if inner.len(b, age.top) > 0 {
            // A thief serialized after our decrement cannot reach this
            // slot, so the task is ours.
            Some(task)
        } else {
            self.pop_contested(task, b, age)
        }
    }

    /// Resolves the race for the last task between this owner and at most
    /// one winning thief.
    ///
    /// Whoever wins, the deque ends up canonically empty with `top ==
    /// bottom` and a fresh tag. The tag bump is what keeps a thief's CAS
    /// built on the old `(top, tag)` from succeeding after we pop this
    /// task and push another into the same slot.
    fn pop_contested(&self, task: T, b: u32, old: Age) -> Option<T> {
        let inner = &*self.inner;
        let new = Age {
            top: b,
            tag: old.tag.wrapping_add(1),
        };

        if old.top == b {
            // No thief has bumped `top` yet; claim the task by installing
            // the empty state ourselves.
            if inner.cas_age(old, new) {
                debug_assert!(
                    inner.dirty_len(b, inner.load_age(Ordering::Relaxed).top)
                        != inner.capacity() - 1
                );
                return Some(task);
            }
        }

        // A thief won and owns the task; discard our speculative read and
        // canonicalize the empty state. A plain store suffices: the owner
        // is the only writer of `bottom`, and the losing CAS above already
        // established `top >= b`.
        inner.age.store(new.pack(), Ordering::SeqCst);
        mem::forget(task);
        debug_assert!(
            inner.dirty_len(b, inner.load_age(Ordering::Relaxed).top) != inner.capacity() - 1
        );
        None
    }

    /// Returns a race-tolerant estimate of how many tasks are queued.
    pub fn len(&self) -> usize {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let age = inner.load_age(Ordering::Relaxed);
        inner.len(b, age.top) as usize
    }

    /// Returns `true` if the deque holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the ring capacity this deque was created with.
    pub fn capacity(&self) -> usize {
        self.inner.capacity() as usize
    }

    /// Returns the number of tasks the deque can actually hold, which is
    /// two less than the ring capacity.
    pub fn max_len(&self) -> usize {
        self.inner.max_len() as usize
    }
}

impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Worker { .. }")
    }
}

/// The stealing handle of a deque.
///
/// Stealers take the *oldest* task, from the end opposite the owner, so a
/// lone thief observes tasks in the order the owner pushed them.
///
/// # Examples
///
/// ```
/// use taskqueue::Worker;
///
/// let w = Worker::new(16);
/// for i in 1..=3 {
///     w.push(i).unwrap();
/// }
///
/// let s = w.stealer();
/// assert_eq!(s.steal(), Some(1));
/// assert_eq!(s.steal(), Some(2));
/// assert_eq!(s.steal(), Some(3));
/// ```
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

unsafe impl<T: Send> Send for Stealer<T> {}
unsafe impl<T: Send> Sync for Stealer<T> {}

impl<T> Stealer<T> {
    /// Takes the oldest task off the top of the deque.
    ///
    /// Returns `None` when the deque is empty and when the attempt loses a
    /// race; the two are indistinguishable, and callers retry elsewhere
    /// either way.
    pub fn steal(&self) -> Option<T> {
        let inner = &*self.inner;
        let old = inner.load_age(Ordering::Acquire);
        let b = inner.bottom.load(Ordering::Acquire);
        if inner.len(b, old.top) == 0 {
            return None;
        }

        // Read the task before claiming it, so a successful CAS implies
        // the value was observed while the slot was still live. If the
        // claim fails the value may be stale and must be discarded.
        let task = unsafe { inner.read(old.top) };

        let top = inner.inc(old.top);
        let new = Age {
            top,
            tag: if top == 0 {
                old.tag.wrapping_add(1)
            } else {
                old.tag
            },
        };

        if inner.cas_age(old, new) {
            Some(task)
        } else {
            mem::forget(task);
            None
        }
    }

    /// Returns a race-tolerant estimate of how many tasks are queued.
    pub fn len(&self) -> usize {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Acquire);
        let age = inner.load_age(Ordering::Acquire);
        inner.len(b, age.top) as usize
    }

    /// Returns `true` if the deque holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Stealer { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::{Age, Worker};
    use core::sync::atomic::Ordering;

    #[test]
    fn age_packs_both_halves() {
        let age = Age {
            top: 0x0123_4567,
            tag: 0x89ab_cdef,
        };
        assert_eq!(Age::unpack(age.pack()), age);
        assert_eq!(Age::unpack(0), Age { top: 0, tag: 0 });
    }

    #[test]
    fn smoke() {
        let w = Worker::new(16);
        assert_eq!(w.pop(), None);
        assert!(w.is_empty());

        w.push(7).unwrap();
        assert_eq!(w.len(), 1);
        assert_eq!(w.pop(), Some(7));
        assert_eq!(w.pop(), None);

        let s = w.stealer();
        assert_eq!(s.steal(), None);
        w.push(8).unwrap();
        assert_eq!(s.steal(), Some(8));
        assert_eq!(s.steal(), None);
        assert_eq!(w.pop(), None);
    }

    #[test]
    fn lifo_pop_order() {
        let w = Worker::new(1 << 11);
        for i in 1..=1000 {
            w.push(i).unwrap();
        }
        for i in (1..=1000).rev() {
            assert_eq!(w.pop(), Some(i));
        }
        assert_eq!(w.pop(), None);
    }

    #[test]
    fn fifo_steal_order() {
        let w = Worker::new(16);
        for i in 1..=3 {
            w.push(i).unwrap();
        }
        let s = w.stealer();
        assert_eq!(s.steal(), Some(1));
        assert_eq!(s.steal(), Some(2));
        assert_eq!(w.pop(), Some(3));
        assert_eq!(s.steal(), None);
    }

    #[test]
    fn full_rejects_push() {
        let w = Worker::new(16);
        assert_eq!(w.max_len(), 14);
        for i in 0..14 {
            assert_eq!(w.push(i), Ok(()));
        }
        assert_eq!(w.push(99), Err(99));
        assert_eq!(w.len(), 14);

        // One pop makes room for exactly one push.
        assert_eq!(w.pop(), Some(13));
        assert_eq!(w.push(99), Ok(()));
        assert_eq!(w.push(100), Err(100));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_capacity() {
        let _ = Worker::<usize>::new(12);
    }

    #[test]
    #[should_panic(expected = "at least 4")]
    fn tiny_capacity() {
        let _ = Worker::<usize>::new(2);
    }

    #[test]
    fn wrap_bumps_tag() {
        let w = Worker::new(16);
        let s = w.stealer();

        let tag_before = w.inner.load_age(Ordering::Relaxed).tag;

        // Drain through the stealer so `top` sweeps the whole ring and
        // wraps past zero.
        for round in 0..2 {
            for i in 0..14 {
                w.push((round, i)).unwrap();
            }
            for i in 0..14 {
                assert_eq!(s.steal(), Some((round, i)));
            }
        }

        let age = w.inner.load_age(Ordering::Relaxed);
        assert!(age.tag > tag_before);
        // 28 steals around a 16-slot ring wrap exactly once.
        assert_eq!(age.tag, tag_before + 1);
        assert_eq!(age.top, 28 % 16);
    }

    #[test]
    fn contested_empty_is_canonicalized() {
        // Single-threaded rendition of the owner/thief empty race: the
        // thief takes the only task, and the owner's next operations see a
        // canonically empty queue, not the transient encoding.
        let w = Worker::new(16);
        let s = w.stealer();

        w.push(1).unwrap();
        assert_eq!(s.steal(), Some(1));
        assert_eq!(w.pop(), None);
        assert_eq!(w.len(), 0);
        assert_eq!(s.len(), 0);

        w.push(2).unwrap();
        assert_eq!(w.pop(), Some(2));
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn pop_to_empty_resets_via_cas() {
        let w: Worker<u64> = Worker::new(16);
        for _ in 0..5 {
            w.push(1).unwrap();
            let tag = w.inner.load_age(Ordering::Relaxed).tag;
            assert_eq!(w.pop(), Some(1));
            // Popping the last task goes through the contested path and
            // bumps the tag even without a thief.
            assert_eq!(w.inner.load_age(Ordering::Relaxed).tag, tag + 1);
            assert_eq!(w.len(), 0);
        }
    }

    #[test]
    fn drops_undrained_tasks() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let w = Worker::new(16);
        for _ in 0..10 {
            w.push(Counted).unwrap();
        }
        drop(w.pop());
        drop(w.stealer().steal());
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);

        drop(w);
        assert_eq!(DROPS.load(Ordering::SeqCst), 10);
    }
}
