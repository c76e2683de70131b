/// A minimalistic spin lock for short critical sections (sleep queues,
/// resumption scratch slots). Queues that a thread may park on are guarded
/// by the scheduler lock instead.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{AcqRel, Relaxed, Release};

pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct LockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Default for SpinLock<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> LockGuard<'_, T> {
        let mut iters = 0_u64;
        while self.locked.swap(true, AcqRel) {
            // Spin while the lock is already locked.
            while self.locked.load(Relaxed) {
                iters += 1;
                if iters > 100_000_000 {
                    panic!("spin_lock.rs: deadlock?");
                }
                core::hint::spin_loop();
            }
        }
        LockGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        if self.locked.swap(true, AcqRel) {
            None
        } else {
            Some(LockGuard { lock: self })
        }
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: The very existence of this Guard
        // guarantees we've exclusively locked the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: The very existence of this Guard
        // guarantees we've exclusively locked the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(0_u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
