//! The true kernel mutex: a sleep queue plus a banked-signal counter.
//!
//! This is the primitive guest syscalls block on, and it doubles as the
//! slow-path collaborator of [`super::LwMutex`]. "Unlock" hands the lock
//! to the next queued thread per the wake protocol; with nobody queued
//! the signal is banked and the next locker consumes it without sleeping.

use std::collections::VecDeque;
use std::sync::Arc;

use lv2_rt::{ErrorCode, SysResult, E_BUSY, E_ESRCH, E_OK, E_TIMEDOUT};

use crate::idm::{KernelObject, ObjKind};
use crate::sched::{AwakeArg, Protocol, Scheduler, WaitResult, WakeBatch};
use crate::thread::{ResumePoint, Thread};
use crate::util::SpinLock;
use crate::Kernel;

struct KMutexInner {
    /// Banked wakes with no thread queued to consume them.
    signaled: u32,
    /// Sleep queue; pop order is decided by the wake protocol.
    sq: VecDeque<Arc<Thread>>,
    dead: bool,
}

pub struct KMutex {
    protocol: Protocol,
    inner: SpinLock<KMutexInner>,
}

impl KernelObject for KMutex {
    const KIND: ObjKind = ObjKind::Mutex;
}

impl KMutex {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            inner: SpinLock::new(KMutexInner {
                signaled: 0,
                sq: VecDeque::new(),
                dead: false,
            }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Blocks until the lock is handed to this thread, the timeout
    /// expires, or a savestate unwinds the wait (0 = wait forever).
    ///
    /// The sleep-queue insert and the scheduler's sleep transition happen
    /// under one critical section, so an unlock on another thread either
    /// sees us queued or has already banked its signal.
    pub fn lock(
        &self,
        k: &Kernel,
        batch: &mut WakeBatch,
        thread: &Arc<Thread>,
        timeout_us: u64,
    ) -> SysResult<()> {
        let deadline = {
            let mut inner = self.inner.lock();
            if inner.dead {
                return SysResult::Err(E_ESRCH);
            }
            if inner.signaled > 0 {
                inner.signaled -= 1;
                // A banked wake on a bounce-protocol mutex is a bounce,
                // not an acquisition.
                return match self.protocol {
                    Protocol::Retry => SysResult::Err(E_BUSY),
                    _ => SysResult::Ok(()),
                };
            }
            inner.sq.push_back(thread.clone());
            k.sched().sleep(batch, thread, timeout_us)
        };

        // Once a waker has picked this thread off the queue, its wake is
        // committed and must be consumed even if a timeout or savestate
        // raced with it.
        let mut committed = false;
        loop {
            let result = if committed {
                k.sched().park_committed(thread)
            } else {
                k.sched().park(thread, deadline)
            };
            match result {
                WaitResult::Woken => {
                    let status = thread.take_wake_status();
                    if status == crate::thread::WAKE_NONE {
                        // A stray admission signal, not a wake from this
                        // queue; keep waiting.
                        continue;
                    }
                    return if status == E_OK {
                        SysResult::Ok(())
                    } else {
                        SysResult::Err(status)
                    };
                }
                WaitResult::TimedOut => {
                    if self.unqueue(thread) {
                        k.sched().awake(thread, AwakeArg::Enqueue);
                        k.sched().check_state(thread);
                        return SysResult::Err(E_TIMEDOUT);
                    }
                    committed = true;
                }
                WaitResult::Interrupted => {
                    if self.unqueue(thread) {
                        k.sched().cancel_sleep(thread);
                        return SysResult::Again;
                    }
                    committed = true;
                }
            }
        }
    }

    /// Blocking lock entry for the direct guest syscall (as opposed to
    /// the lightweight-mutex slow path, which keeps its own resumption
    /// record). A replayed call re-queues with the remaining timeout.
    pub fn lock_syscall(
        &self,
        k: &Kernel,
        thread: &Arc<Thread>,
        timeout_us: u64,
    ) -> SysResult<()> {
        let timeout_us = match thread.take_resume() {
            Some(ResumePoint::KMutexLock { timeout_us }) => timeout_us,
            Some(other) => panic!("mismatched resumption record: {other:?}"),
            None => timeout_us,
        };
        let enter = k.sched().time_us();
        let mut batch = WakeBatch::new();
        match self.lock(k, &mut batch, thread, timeout_us) {
            SysResult::Again => {
                let remaining = if timeout_us == 0 {
                    0
                } else {
                    let elapsed = k.sched().time_us() - enter;
                    timeout_us.saturating_sub(elapsed).max(1)
                };
                thread.stash_resume(ResumePoint::KMutexLock {
                    timeout_us: remaining,
                });
                SysResult::Again
            }
            done => done,
        }
    }

    /// Consumes a banked signal without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.dead || inner.signaled == 0 {
            false
        } else {
            inner.signaled -= 1;
            true
        }
    }

    /// Hands the lock to the next queued thread, or banks the signal.
    pub fn unlock(&self, k: &Kernel, batch: &mut WakeBatch) -> Result<(), ErrorCode> {
        self.wake_one(k, batch, E_OK)
    }

    /// Non-blocking wake used by the RETRY protocol: the woken thread is
    /// sent back to the fast path instead of being handed the lock.
    pub fn signal_retry(&self, k: &Kernel, batch: &mut WakeBatch) -> Result<(), ErrorCode> {
        self.wake_one(k, batch, E_BUSY)
    }

    fn wake_one(&self, k: &Kernel, batch: &mut WakeBatch, status: ErrorCode) -> Result<(), ErrorCode> {
        {
            let mut inner = self.inner.lock();
            if inner.dead {
                return Err(E_ESRCH);
            }
            match Scheduler::schedule(&mut inner.sq, self.protocol) {
                Some(target) => {
                    log::trace!("kmutex wake: tid={} status={}", target.id(), status);
                    target.set_wake_status(status);
                    batch.append(target);
                }
                None => inner.signaled += 1,
            }
        }
        k.sched().awake_all(batch);
        Ok(())
    }

    /// Refuses while threads are queued; queued waiters must drain (or
    /// time out) before the object can go away.
    pub fn destroy(&self) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        if inner.dead {
            return Err(E_ESRCH);
        }
        if !inner.sq.is_empty() {
            return Err(E_BUSY);
        }
        inner.dead = true;
        Ok(())
    }

    fn unqueue(&self, thread: &Arc<Thread>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.sq.iter().position(|t| Arc::ptr_eq(t, thread)) {
            inner.sq.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn kernel() -> Arc<Kernel> {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(Config::default())
    }

    #[test]
    fn banked_signal_serves_next_locker() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = KMutex::new(Protocol::Fifo);
        let mut batch = WakeBatch::new();
        m.unlock(&k, &mut batch).unwrap();
        // The banked signal is consumed without sleeping.
        assert_eq!(m.lock(&k, &mut batch, &t, 0).expect_done(), Ok(()));
    }

    #[test]
    fn banked_retry_signal_bounces() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = KMutex::new(Protocol::Retry);
        let mut batch = WakeBatch::new();
        m.signal_retry(&k, &mut batch).unwrap();
        assert!(matches!(
            m.lock(&k, &mut batch, &t, 0),
            SysResult::Err(E_BUSY)
        ));
    }

    #[test]
    fn blocked_locker_is_woken() {
        let k = kernel();
        let m = Arc::new(KMutex::new(Protocol::Fifo));
        let t = k.create_thread(1, 1000);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut batch = WakeBatch::new();
                m.lock(&k, &mut batch, &t, 0).expect_done()
            });
            std::thread::sleep(Duration::from_millis(50));
            let mut batch = WakeBatch::new();
            m.unlock(&k, &mut batch).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn lock_times_out() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = KMutex::new(Protocol::Fifo);
        let mut batch = WakeBatch::new();
        assert!(matches!(
            m.lock(&k, &mut batch, &t, 20_000),
            SysResult::Err(E_TIMEDOUT)
        ));
        // The queue is clean afterwards: an unlock banks its signal.
        m.unlock(&k, &mut batch).unwrap();
        assert!(m.try_acquire());
    }

    #[test]
    fn savestate_unwinds_blocked_lock() {
        let k = kernel();
        let m = Arc::new(KMutex::new(Protocol::Fifo));
        let t = k.create_thread(1, 1000);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| m.lock_syscall(&k, &t, 0).is_again());
            std::thread::sleep(Duration::from_millis(50));
            k.sched().begin_savestate();
            assert!(waiter.join().unwrap());
        });
        assert!(t.state().contains(crate::thread::ThreadFlags::AGAIN));

        // After the savestate the call replays and can complete.
        k.sched().end_savestate();
        k.sched().reschedule(&t);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| m.lock_syscall(&k, &t, 0).expect_done());
            std::thread::sleep(Duration::from_millis(50));
            let mut batch = WakeBatch::new();
            m.unlock(&k, &mut batch).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn destroy_refuses_waiters() {
        let k = kernel();
        let m = Arc::new(KMutex::new(Protocol::Fifo));
        let t = k.create_thread(1, 1000);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut batch = WakeBatch::new();
                m.lock(&k, &mut batch, &t, 0).expect_done()
            });
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(m.destroy(), Err(E_BUSY));
            let mut batch = WakeBatch::new();
            m.unlock(&k, &mut batch).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
        assert_eq!(m.destroy(), Ok(()));
        let mut batch = WakeBatch::new();
        assert!(matches!(m.lock(&k, &mut batch, &t, 0), SysResult::Err(E_ESRCH)));
        assert_eq!(m.destroy(), Err(E_ESRCH));
    }
}
