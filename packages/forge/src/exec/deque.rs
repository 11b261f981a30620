//! A Chase–Lev work-stealing deque.
//!
//! One owner pushes and pops the bottom (LIFO, wait-free); any number of
//! stealers take the top (FIFO, lock-free). The implementation follows the
//! Chase–Lev algorithm with the sequentially-consistent fences from Lê et
//! al.'s C11 formulation.
//!
//! Elements are `Copy`: the scheduler queues action ids, never owned data,
//! which keeps the racy slot reads trivially sound: a stealer that loses
//! the CAS simply discards its copy.
//!
//! Buffer growth retires the old allocation into a side list instead of
//! freeing it, because a stealer may still be reading a slot through the
//! stale pointer. Retired buffers are reclaimed when the deque itself is
//! dropped; for queues of ids the waste is a few kilobytes per growth.

#[cfg(loom)]
use loom::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};

use std::{cell::UnsafeCell, sync::Arc, sync::Mutex};

/// Result of a steal attempt.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Steal<T> {
    /// The deque was observed empty.
    Empty,
    /// Lost a race; worth trying again.
    Retry,
    /// Took the top element.
    Success(T),
}

struct Buffer<T> {
    cap: usize,
    slots: Box<[UnsafeCell<T>]>,
}

impl<T: Copy + Default> Buffer<T> {
    fn alloc(cap: usize) -> Box<Self> {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { cap, slots })
    }

    unsafe fn read(&self, index: isize) -> T {
        let slot = &self.slots[index as usize & (self.cap - 1)];
        unsafe { *slot.get() }
    }

    unsafe fn write(&self, index: isize, value: T) {
        let slot = &self.slots[index as usize & (self.cap - 1)];
        unsafe { *slot.get() = value }
    }
}

struct Inner<T> {
    top: AtomicIsize,
    bottom: AtomicIsize,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by growth, kept alive for in-flight stealers.
    retired: Mutex<Vec<*mut Buffer<T>>>,
}

unsafe impl<T: Copy + Send> Send for Inner<T> {}
unsafe impl<T: Copy + Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Sole owner at this point; a plain load suffices (and loom's
        // atomics have no `get_mut`).
        let current = self.buffer.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(current) });
        for retired in self.retired.lock().expect("retired lock").drain(..) {
            drop(unsafe { Box::from_raw(retired) });
        }
    }
}

/// The owning side of the deque. Not cloneable: push and pop are
/// single-owner operations.
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
}

/// The stealing side of the deque. Cheap to clone and share.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy + Default + Send> Worker<T> {
    /// Create an empty deque with the given initial capacity (rounded up
    /// to a power of two).
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(2);
        let buffer = Box::into_raw(Buffer::<T>::alloc(cap));
        Worker {
            inner: Arc::new(Inner {
                top: AtomicIsize::new(0),
                bottom: AtomicIsize::new(0),
                buffer: AtomicPtr::new(buffer),
                retired: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a stealer handle for this deque.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Push onto the bottom. Owner only; wait-free apart from growth.
    pub fn push(&self, value: T) {
        let inner = &self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = inner.top.load(Ordering::Acquire);
        let mut buffer = inner.buffer.load(Ordering::Relaxed);

        let len = bottom - top;
        if len >= unsafe { (*buffer).cap } as isize {
            buffer = self.grow(top, bottom, buffer);
        }

        unsafe { (*buffer).write(bottom, value) };
        inner.bottom.store(bottom + 1, Ordering::Release);
    }

    /// Pop from the bottom. Owner only; wait-free.
    pub fn pop(&self) -> Option<T> {
        let inner = &self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = inner.buffer.load(Ordering::Relaxed);
        inner.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = inner.top.load(Ordering::Relaxed);

        if top > bottom {
            // Empty: restore bottom.
            inner.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        let value = unsafe { (*buffer).read(bottom) };
        if top != bottom {
            return Some(value);
        }

        // Last element: race any stealer for it via `top`.
        let won = inner
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.bottom.store(bottom + 1, Ordering::Relaxed);
        won.then_some(value)
    }

    /// Number of queued elements, approximate under concurrency.
    pub fn len(&self) -> usize {
        let bottom = self.inner.bottom.load(Ordering::Relaxed);
        let top = self.inner.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    /// Whether the deque looks empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Double the buffer, copying the live range. Owner only.
    fn grow(&self, top: isize, bottom: isize, old: *mut Buffer<T>) -> *mut Buffer<T> {
        let old_ref = unsafe { &*old };
        let new = Buffer::<T>::alloc(old_ref.cap * 2);
        for index in top..bottom {
            unsafe { new.write(index, old_ref.read(index)) };
        }
        let new = Box::into_raw(new);
        self.inner.buffer.store(new, Ordering::Release);
        self.inner
            .retired
            .lock()
            .expect("retired lock")
            .push(old);
        new
    }
}

impl<T: Copy + Default + Send> Stealer<T> {
    /// Steal from the top.
    pub fn steal(&self) -> Steal<T> {
        let inner = &self.inner;
        let top = inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = inner.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // Read the slot before claiming it; a failed CAS discards the copy.
        let buffer = inner.buffer.load(Ordering::Acquire);
        let value = unsafe { (*buffer).read(top) };
        if inner
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Success(value)
        } else {
            Steal::Retry
        }
    }

    /// Whether the deque looks empty.
    pub fn is_empty(&self) -> bool {
        let bottom = self.inner.bottom.load(Ordering::Relaxed);
        let top = self.inner.top.load(Ordering::Relaxed);
        top >= bottom
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn lifo_for_owner() {
        let worker = Worker::new(4);
        worker.push(1u32);
        worker.push(2);
        worker.push(3);

        pretty_assert_eq!(worker.pop(), Some(3));
        pretty_assert_eq!(worker.pop(), Some(2));
        pretty_assert_eq!(worker.pop(), Some(1));
        pretty_assert_eq!(worker.pop(), None);
    }

    #[test]
    fn fifo_for_stealers() {
        let worker = Worker::new(4);
        let stealer = worker.stealer();
        worker.push(1u32);
        worker.push(2);

        pretty_assert_eq!(stealer.steal(), Steal::Success(1));
        pretty_assert_eq!(stealer.steal(), Steal::Success(2));
        pretty_assert_eq!(stealer.steal(), Steal::Empty);
    }

    #[test]
    fn growth_preserves_elements() {
        let worker = Worker::new(2);
        for value in 0..100u32 {
            worker.push(value);
        }
        pretty_assert_eq!(worker.len(), 100);

        let mut popped = Vec::new();
        while let Some(value) = worker.pop() {
            popped.push(value);
        }
        popped.reverse();
        pretty_assert_eq!(popped, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_steals_take_each_element_once() {
        const ITEMS: u32 = 10_000;
        const STEALERS: usize = 4;

        let worker = Worker::new(64);
        let stolen = std::sync::Mutex::new(Vec::new());
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..STEALERS {
                let stealer = worker.stealer();
                let stolen = &stolen;
                let done = &done;
                scope.spawn(move || {
                    let mut local = Vec::new();
                    loop {
                        match stealer.steal() {
                            Steal::Success(value) => local.push(value),
                            Steal::Retry => continue,
                            Steal::Empty => {
                                if done.load(std::sync::atomic::Ordering::Acquire) {
                                    break;
                                }
                                std::hint::spin_loop();
                            }
                        }
                    }
                    stolen.lock().unwrap().extend(local);
                });
            }

            let mut popped = Vec::new();
            for value in 0..ITEMS {
                worker.push(value);
                // Interleave pops to exercise the last-element race.
                if value % 3 == 0 {
                    if let Some(value) = worker.pop() {
                        popped.push(value);
                    }
                }
            }
            while let Some(value) = worker.pop() {
                popped.push(value);
            }
            done.store(true, std::sync::atomic::Ordering::Release);

            stolen.lock().unwrap().extend(popped);
        });

        let mut all = stolen.into_inner().unwrap();
        all.sort_unstable();
        pretty_assert_eq!(all.len(), ITEMS as usize, "no element lost or duplicated");
        pretty_assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
    }
}
