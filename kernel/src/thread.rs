//! The emulated PPU thread.
//!
//! Each guest thread maps to one host thread. The kernel only keeps the
//! metadata needed for scheduling (priority, state flags), a host-side
//! parking pair for actual blocking, and a scratch slot that lets any
//! blocking syscall be suspended and replayed across a savestate.

use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use lv2_rt::ErrorCode;

use crate::util::SpinLock;

/// "No wake status delivered" sentinel; distinguishes a real wake (the
/// waker stores a status first) from a stray admission signal.
pub(crate) const WAKE_NONE: ErrorCode = u16::MAX;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Removed from the running window; must wait for SIGNAL.
        const SUSPEND = 1 << 0;
        /// Scheduled to run; consumed by the thread when it wakes.
        const SIGNAL = 1 << 1;
        /// The last blocking operation must be replayed from its
        /// resumption record.
        const AGAIN = 1 << 2;
    }
}

/// Where an interrupted blocking syscall left off. Written next to the
/// `Again` signal; consumed on re-entry so that nothing already committed
/// runs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Interrupted inside the lightweight-mutex slow path.
    LwMutexLock {
        /// Timeout remaining at the interruption point (0 = infinite).
        timeout_us: u64,
        /// The fast path and ownership checks already ran; skip them.
        fast_path_done: bool,
        /// The waiter count increment was already committed.
        waiter_charged: bool,
        /// How many RETRY-protocol restarts completed.
        retry_round: u32,
    },
    /// Interrupted while blocked directly on a kernel mutex.
    KMutexLock { timeout_us: u64 },
}

pub struct Thread {
    id: u32,
    prio: AtomicI32,
    state: AtomicU32,

    /// Guest time (us) at which the thread last went to sleep.
    pub(crate) start_time: AtomicU64,

    /// Status delivered by whoever woke this thread.
    wake_status: AtomicU16,

    resume: SpinLock<Option<ResumePoint>>,

    // Host-side parking: a wake counter under the mutex, so a notify
    // between the flag check and the wait cannot be lost.
    pub(crate) park_lock: Mutex<u64>,
    pub(crate) park_cond: Condvar,
}

impl Thread {
    pub fn new(id: u32, prio: i32) -> std::sync::Arc<Self> {
        assert!(id != 0, "thread id 0 is reserved for 'no owner'");
        assert!(
            (lv2_rt::PRIO_MIN..=lv2_rt::PRIO_MAX).contains(&prio),
            "thread priority out of window: {prio}"
        );
        std::sync::Arc::new(Self {
            id,
            prio: AtomicI32::new(prio),
            state: AtomicU32::new(0),
            start_time: AtomicU64::new(0),
            wake_status: AtomicU16::new(WAKE_NONE),
            resume: SpinLock::new(None),
            park_lock: Mutex::new(0),
            park_cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn prio(&self) -> i32 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn swap_prio(&self, prio: i32) -> i32 {
        self.prio.swap(prio, Ordering::Relaxed)
    }

    pub fn state(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn add_flags(&self, flags: ThreadFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: ThreadFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Sets SUSPEND; returns true if it was already set.
    pub(crate) fn test_and_set_suspend(&self) -> bool {
        let prev = self.state.fetch_or(ThreadFlags::SUSPEND.bits(), Ordering::AcqRel);
        prev & ThreadFlags::SUSPEND.bits() != 0
    }

    /// SUSPEND -> SIGNAL flip performed when the scheduler admits the
    /// thread into the running window. Returns false if the thread was
    /// not suspended (nothing to flip).
    pub(crate) fn grant_signal(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & ThreadFlags::SUSPEND.bits() != 0 {
                    Some(bits ^ (ThreadFlags::SUSPEND | ThreadFlags::SIGNAL).bits())
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Consumes a pending SIGNAL. Returns whether one was pending.
    pub(crate) fn consume_signal(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & ThreadFlags::SIGNAL.bits() != 0 {
                    Some(bits & !ThreadFlags::SIGNAL.bits())
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub(crate) fn set_wake_status(&self, status: ErrorCode) {
        self.wake_status.store(status, Ordering::Release);
    }

    pub(crate) fn take_wake_status(&self) -> ErrorCode {
        self.wake_status.swap(WAKE_NONE, Ordering::AcqRel)
    }

    /// Wakes the host thread if it is parked. Safe to call at any time;
    /// the parked side re-checks its predicate.
    pub(crate) fn notify(&self) {
        let mut counter = self.park_lock.lock().unwrap();
        *counter += 1;
        self.park_cond.notify_all();
    }

    /// Records where an interrupted blocking call left off and flags the
    /// thread for replay.
    pub fn stash_resume(&self, point: ResumePoint) {
        let mut slot = self.resume.lock();
        assert!(slot.is_none(), "resumption record already pending");
        *slot = Some(point);
        self.add_flags(ThreadFlags::AGAIN);
    }

    /// Consumes the resumption record, if any, clearing the replay flag.
    pub fn take_resume(&self) -> Option<ResumePoint> {
        let point = self.resume.lock().take();
        if point.is_some() {
            self.remove_flags(ThreadFlags::AGAIN);
        }
        point
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("prio", &self.prio())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_flip() {
        let t = Thread::new(1, 500);
        assert!(!t.consume_signal());
        assert!(!t.test_and_set_suspend());
        assert!(t.test_and_set_suspend());
        assert!(t.grant_signal());
        assert!(!t.state().contains(ThreadFlags::SUSPEND));
        assert!(t.consume_signal());
        assert!(!t.consume_signal());
    }

    #[test]
    fn resume_roundtrip() {
        let t = Thread::new(2, 1000);
        assert!(t.take_resume().is_none());
        t.stash_resume(ResumePoint::KMutexLock { timeout_us: 42 });
        assert!(t.state().contains(ThreadFlags::AGAIN));
        assert_eq!(
            t.take_resume(),
            Some(ResumePoint::KMutexLock { timeout_us: 42 })
        );
        assert!(!t.state().contains(ThreadFlags::AGAIN));
        assert!(t.take_resume().is_none());
    }

    #[test]
    #[should_panic]
    fn zero_id_rejected() {
        let _ = Thread::new(0, 500);
    }
}
