//! A mutex container similar to `std::sync::Mutex<T>` but parameterized over
//! any type `L` implementing the [`Lock`] trait, so that callers in `no_std`
//! environments can bring their own synchronization: a spinlock for
//! multi-threaded use, an interrupt-disable guard for single-CPU interrupt
//! safety, or the checked no-op [`SingleThreadedLock`] default.
//!
//! The guard brackets exactly the pool's tree and span-list mutations;
//! header construction and parsing happen outside it, on memory the caller
//! already exclusively owns.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

/// A trait for providing mutual exclusion around the pool's critical
/// sections.
///
/// Acquisition happens on guard construction and release on guard
/// destruction, so a lock is held for exactly the duration of one tree or
/// span-list mutation. No pool operation blocks, suspends, or yields while
/// holding it.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a pool using this locking
///   mechanism will be `Sync`, and therefore `lock` must provide actual
///   mutual exclusion and prevent unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking and re-entering the
///   lock when it is already held. The prevention may be a panic, abort,
///   infinite loop, or etc...
pub unsafe trait Lock {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must result in a panic, abort, infinite
    /// loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`: it performs no synchronization, only a
/// reentrancy check, making it the right default for pools used from one
/// execution context at a time.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get());
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another
// thread and getting a mutex guard allows getting `&mut T`, which can be
// used to `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}
