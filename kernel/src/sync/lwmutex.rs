//! The hybrid lightweight mutex.
//!
//! Uncontended lock/unlock never touches the kernel: ownership is a CAS
//! on the packed lock word. Contended paths charge the waiter count and
//! fall back to a backing [`KMutex`]; on wake, ownership is handed over
//! from a reserved sentinel so the lock is never observably free in
//! between. The RETRY protocol skips the handover and bounces woken
//! threads back to the fast path instead.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use lv2_rt::{
    ErrorCode, SysResult, E_BUSY, E_DEADLK, E_ESRCH, E_KRESOURCE, E_PERM, E_TIMEDOUT,
};

use crate::idm::{IpcFlags, KernelObject, ObjKind, ObjectId, Pshared};
use crate::sched::{Protocol, WakeBatch};
use crate::sync::{parse_sync_attr, KMutex};
use crate::thread::{ResumePoint, Thread};
use crate::Kernel;

/// Nobody holds the lock.
pub const LW_FREE: u32 = 0;
/// Ownership is in flight between an unlocker and the waiter it woke.
pub const LW_RESERVED: u32 = u32::MAX;
/// The object was destroyed.
pub const LW_DEAD: u32 = u32::MAX - 1;

const WAITER_UNIT: u64 = 1 << 32;
const HINT_MASK: u64 = (1 << 32) - 1;

/// The packed guest-visible lock word.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockVar {
    pub owner: u32,
    pub generation: u32,
}

pub struct LwMutex {
    id: ObjectId,
    attr: u32,
    protocol: Protocol,
    recursive: bool,
    ipc_key: u64,
    pshared: Pshared,

    /// Backing kernel mutex used only on the slow path.
    kmutex: ObjectId,

    lock_var: AtomicCell<LockVar>,

    /// High half: waiter count. Low half: owner hint, a mirror of the
    /// lock word's owner kept for the guest ABI; never authoritative.
    all_info: AtomicU64,

    /// Nesting depth above the first acquisition; only the owner
    /// touches it.
    recursive_count: AtomicU32,
}

impl KernelObject for LwMutex {
    const KIND: ObjKind = ObjKind::LwMutex;
}

impl LwMutex {
    /// Creates a lightweight mutex (and its private backing kernel
    /// mutex), or attaches to an existing IPC registration. Returns the
    /// id and whether the object is new.
    pub fn create(
        k: &Kernel,
        attr: u32,
        pshared: Pshared,
        ipc_key: u64,
        flags: IpcFlags,
    ) -> Result<(ObjectId, bool), ErrorCode> {
        let (protocol, recursive) = parse_sync_attr(attr)?;

        // The backing mutex is allocated first; the registry lock is held
        // while the lightweight mutex itself is built.
        let (kmx_id, _, _) = k.registry().create::<KMutex>(Pshared::No, 0, IpcFlags::NotCare, |_| {
            Ok(Arc::new(KMutex::new(protocol)))
        })?;

        let result = k.registry().create::<LwMutex>(pshared, ipc_key, flags, |id| {
            Ok(Arc::new(LwMutex {
                id,
                attr,
                protocol,
                recursive,
                ipc_key,
                pshared,
                kmutex: kmx_id,
                lock_var: AtomicCell::new(LockVar {
                    owner: LW_FREE,
                    generation: 0,
                }),
                all_info: AtomicU64::new(0),
                recursive_count: AtomicU32::new(0),
            }))
        });

        match result {
            Ok((id, _, created)) => {
                if !created {
                    // Attached to an existing object; the spare backing
                    // mutex goes away.
                    k.registry().on_id_destroy(kmx_id, 0, Pshared::No);
                }
                Ok((id, created))
            }
            Err(code) => {
                k.registry().on_id_destroy(kmx_id, 0, Pshared::No);
                Err(code)
            }
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn attr(&self) -> u32 {
        self.attr
    }

    pub fn owner(&self) -> u32 {
        self.lock_var.load().owner
    }

    pub fn waiters(&self) -> u32 {
        (self.all_info.load(Ordering::SeqCst) >> 32) as u32
    }

    pub fn recursion_depth(&self) -> u32 {
        self.recursive_count.load(Ordering::Relaxed)
    }

    /// Acquires the lock, blocking up to `timeout_us` guest microseconds
    /// (0 = wait forever). Returns `Again` when a savestate unwound the
    /// wait; the recorded state makes the replayed call skip everything
    /// already committed.
    pub fn lock(
        &self,
        k: &Kernel,
        batch: &mut WakeBatch,
        thread: &Arc<Thread>,
        timeout_us: u64,
    ) -> SysResult<()> {
        let tid = thread.id();
        let (mut timeout, mut fast_path_done, mut waiter_charged, mut retry_round) =
            match thread.take_resume() {
                Some(ResumePoint::LwMutexLock {
                    timeout_us,
                    fast_path_done,
                    waiter_charged,
                    retry_round,
                }) => (timeout_us, fast_path_done, waiter_charged, retry_round),
                Some(other) => panic!("mismatched resumption record: {other:?}"),
                None => (timeout_us, false, false, 0),
            };

        loop {
            if !fast_path_done {
                if let Some(decided) = self.spin_acquire(tid, k.config().spin_iters) {
                    return decided.into();
                }
                fast_path_done = true;
            }

            if !waiter_charged {
                self.all_info.fetch_add(WAITER_UNIT, Ordering::SeqCst);
                waiter_charged = true;
            }

            // One more attempt after charging closes the race with a fast
            // unlock that observed no waiters.
            let seen = self.lock_var.load();
            if seen.owner == LW_FREE && self.try_claim(seen, tid) {
                self.uncharge_waiter();
                return SysResult::Ok(());
            }

            let Some(kmx) = k.registry().get::<KMutex>(self.kmutex) else {
                self.uncharge_waiter();
                return SysResult::Err(E_ESRCH);
            };

            let enter = k.sched().time_us();
            match kmx.lock(k, batch, thread, timeout) {
                SysResult::Ok(()) => {
                    // Handover: the unlocker published the reserved
                    // sentinel before waking us. Anything else means the
                    // emulation itself diverged.
                    let cur = self.lock_var.load();
                    assert_eq!(cur.owner, LW_RESERVED, "ownership handover corrupted: {cur:?}");
                    self.lock_var.store(LockVar {
                        owner: tid,
                        generation: cur.generation.wrapping_add(1),
                    });
                    self.uncharge_waiter();
                    self.set_owner_hint(tid);
                    return SysResult::Ok(());
                }
                SysResult::Err(code) if code == E_BUSY && self.protocol == Protocol::Retry => {
                    self.uncharge_waiter();
                    waiter_charged = false;
                    if timeout != 0 {
                        let elapsed = k.sched().time_us() - enter;
                        if elapsed >= timeout {
                            return SysResult::Err(E_TIMEDOUT);
                        }
                        timeout -= elapsed;
                    }
                    retry_round += 1;
                    fast_path_done = false;
                    log::trace!(
                        "lwmutex {:x}: tid={} bounced, round {}",
                        self.id.as_u64(),
                        tid,
                        retry_round
                    );
                }
                SysResult::Err(code) => {
                    // Timed out, or the object was destroyed under us.
                    debug_assert!(
                        code == E_TIMEDOUT || code == E_ESRCH,
                        "impossible slow-path status: {code}"
                    );
                    self.uncharge_waiter();
                    return SysResult::Err(code);
                }
                SysResult::Again => {
                    if timeout != 0 {
                        let elapsed = k.sched().time_us() - enter;
                        timeout = timeout.saturating_sub(elapsed).max(1);
                    }
                    thread.stash_resume(ResumePoint::LwMutexLock {
                        timeout_us: timeout,
                        fast_path_done: true,
                        waiter_charged: true,
                        retry_round,
                    });
                    return SysResult::Again;
                }
            }
        }
    }

    /// Non-blocking acquire. An in-flight handover can be claimed here
    /// iff the backing mutex still banks the unlocker's signal.
    pub fn trylock(&self, k: &Kernel, thread: &Arc<Thread>) -> Result<(), ErrorCode> {
        let tid = thread.id();
        loop {
            let cur = self.lock_var.load();
            match cur.owner {
                LW_FREE => {
                    if self.try_claim(cur, tid) {
                        return Ok(());
                    }
                }
                LW_DEAD => return Err(E_ESRCH),
                LW_RESERVED => {
                    let kmx = k.registry().get::<KMutex>(self.kmutex).ok_or(E_ESRCH)?;
                    if !kmx.try_acquire() {
                        return Err(E_BUSY);
                    }
                    // The consumed signal makes us the sole claimant.
                    let claimed = self.lock_var.compare_exchange(
                        cur,
                        LockVar {
                            owner: tid,
                            generation: cur.generation.wrapping_add(1),
                        },
                    );
                    assert!(claimed.is_ok(), "ownership handover corrupted");
                    self.set_owner_hint(tid);
                    return Ok(());
                }
                owner if owner == tid => return self.relock(),
                _ => return Err(E_BUSY),
            }
        }
    }

    /// Releases the lock. Without waiters this is a plain CAS back to
    /// free; with waiters, ownership moves through the backing mutex.
    pub fn unlock(
        &self,
        k: &Kernel,
        batch: &mut WakeBatch,
        thread: &Arc<Thread>,
    ) -> Result<(), ErrorCode> {
        let tid = thread.id();
        let cur = self.lock_var.load();
        if cur.owner != tid {
            return Err(E_PERM);
        }

        let depth = self.recursive_count.load(Ordering::Relaxed);
        if depth > 0 {
            self.recursive_count.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }

        if self.protocol == Protocol::Retry {
            // Bounce protocol: publish free first, then kick the waiters
            // back to the fast path.
            self.release(cur);
            if self.waiters() > 0 {
                let kmx = k.registry().get::<KMutex>(self.kmutex).ok_or(E_ESRCH)?;
                kmx.signal_retry(k, batch)?;
            }
            return Ok(());
        }

        if self.waiters() == 0 {
            self.release(cur);
            // A waiter may have charged between the count check and the
            // release; hand the lock to the backing mutex so it cannot
            // be stranded.
            if self.waiters() > 0 {
                let freed = self.lock_var.load();
                if freed.owner == LW_FREE
                    && self
                        .lock_var
                        .compare_exchange(
                            freed,
                            LockVar {
                                owner: LW_RESERVED,
                                generation: freed.generation.wrapping_add(1),
                            },
                        )
                        .is_ok()
                {
                    let kmx = k.registry().get::<KMutex>(self.kmutex).ok_or(E_ESRCH)?;
                    kmx.unlock(k, batch)?;
                }
            }
            return Ok(());
        }

        // Direct handover: the next waiter takes ownership from the
        // reserved sentinel without the lock ever being observably free.
        self.lock_var.store(LockVar {
            owner: LW_RESERVED,
            generation: cur.generation.wrapping_add(1),
        });
        self.clear_owner_hint();
        let kmx = k.registry().get::<KMutex>(self.kmutex).ok_or(E_ESRCH)?;
        kmx.unlock(k, batch)
    }

    /// Tears the object down for every attached handle. The caller must
    /// be able to take the lock uncontended; queued waiters make the
    /// destroy fail with "busy".
    pub fn destroy(&self, k: &Kernel, thread: &Arc<Thread>) -> Result<(), ErrorCode> {
        match self.trylock(k, thread) {
            Ok(()) if self.recursion_depth() > 0 => {
                // The probe relocked a recursive mutex the caller already
                // holds; that is still "held", not destroyable.
                self.recursive_count.fetch_sub(1, Ordering::Relaxed);
                return Err(E_BUSY);
            }
            Ok(()) => {}
            Err(code) if code == E_BUSY || code == E_DEADLK => return Err(E_BUSY),
            Err(code) => return Err(code),
        }

        let kmx = k.registry().get::<KMutex>(self.kmutex).ok_or(E_ESRCH)?;
        if let Err(code) = kmx.destroy() {
            // Waiters slipped in behind the probe lock; back out.
            let mut batch = WakeBatch::new();
            let _ = self.unlock(k, &mut batch, thread);
            return Err(code);
        }

        let cur = self.lock_var.load();
        self.lock_var.store(LockVar {
            owner: LW_DEAD,
            generation: cur.generation.wrapping_add(1),
        });
        k.registry().remove(self.kmutex, 0, Pshared::No);
        k.registry().remove(self.id, self.ipc_key, self.pshared);
        log::debug!("lwmutex {:x}: destroyed", self.id.as_u64());
        Ok(())
    }

    fn spin_acquire(&self, tid: u32, spin_iters: u32) -> Option<Result<(), ErrorCode>> {
        for _ in 0..=spin_iters {
            let cur = self.lock_var.load();
            match cur.owner {
                LW_FREE => {
                    if self.try_claim(cur, tid) {
                        return Some(Ok(()));
                    }
                }
                LW_DEAD => return Some(Err(E_ESRCH)),
                owner if owner == tid => return Some(self.relock()),
                _ => core::hint::spin_loop(),
            }
        }
        None
    }

    fn try_claim(&self, cur: LockVar, tid: u32) -> bool {
        let claimed = self
            .lock_var
            .compare_exchange(
                cur,
                LockVar {
                    owner: tid,
                    generation: cur.generation.wrapping_add(1),
                },
            )
            .is_ok();
        if claimed {
            self.set_owner_hint(tid);
        }
        claimed
    }

    fn relock(&self) -> Result<(), ErrorCode> {
        if !self.recursive {
            return Err(E_DEADLK);
        }
        let depth = self.recursive_count.load(Ordering::Relaxed);
        if depth == u32::MAX {
            return Err(E_KRESOURCE);
        }
        self.recursive_count.store(depth + 1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, cur: LockVar) {
        self.lock_var.store(LockVar {
            owner: LW_FREE,
            generation: cur.generation.wrapping_add(1),
        });
        self.clear_owner_hint();
    }

    fn uncharge_waiter(&self) {
        self.all_info.fetch_sub(WAITER_UNIT, Ordering::SeqCst);
    }

    fn set_owner_hint(&self, owner: u32) {
        let _ = self
            .all_info
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some((v & !HINT_MASK) | owner as u64)
            });
    }

    fn clear_owner_hint(&self) {
        self.set_owner_hint(LW_FREE);
    }

    #[cfg(test)]
    pub(crate) fn force_recursion_depth(&self, depth: u32) {
        self.recursive_count.store(depth, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use lv2_rt::{E_INVAL, SYS_SYNC_FIFO, SYS_SYNC_NOT_RECURSIVE, SYS_SYNC_RECURSIVE};

    fn kernel() -> Arc<Kernel> {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(Config::default())
    }

    fn fifo(k: &Kernel) -> Arc<LwMutex> {
        let (id, _) = LwMutex::create(
            k,
            SYS_SYNC_FIFO | SYS_SYNC_NOT_RECURSIVE,
            Pshared::No,
            0,
            IpcFlags::NotCare,
        )
        .unwrap();
        k.registry().get::<LwMutex>(id).unwrap()
    }

    #[test]
    fn create_rejects_bad_attr() {
        let k = kernel();
        assert_eq!(
            LwMutex::create(&k, 0xdead_0000, Pshared::No, 0, IpcFlags::NotCare).unwrap_err(),
            E_INVAL
        );
        // The backing mutex allocation was rolled back.
        assert_eq!(k.registry().count(ObjKind::Mutex), 0);
    }

    #[test]
    fn fast_path_roundtrip() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();

        assert_eq!(m.owner(), LW_FREE);
        assert_eq!(m.lock(&k, &mut batch, &t, 0).expect_done(), Ok(()));
        assert_eq!(m.owner(), 1);
        assert_eq!(m.unlock(&k, &mut batch, &t), Ok(()));
        assert_eq!(m.owner(), LW_FREE);
    }

    #[test]
    fn generation_advances_per_transition() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();

        let before = m.lock_var.load().generation;
        m.lock(&k, &mut batch, &t, 0).expect_done().unwrap();
        m.unlock(&k, &mut batch, &t).unwrap();
        assert_eq!(m.lock_var.load().generation, before.wrapping_add(2));
    }

    #[test]
    fn non_recursive_relock_deadlocks() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();
        m.lock(&k, &mut batch, &t, 0).expect_done().unwrap();
        assert_eq!(m.lock(&k, &mut batch, &t, 0).expect_done(), Err(E_DEADLK));
        assert_eq!(m.trylock(&k, &t), Err(E_DEADLK));
    }

    #[test]
    fn recursion_depth_overflow() {
        let k = kernel();
        let t = k.create_thread(1, 1000);
        let (id, _) = LwMutex::create(
            &k,
            SYS_SYNC_FIFO | SYS_SYNC_RECURSIVE,
            Pshared::No,
            0,
            IpcFlags::NotCare,
        )
        .unwrap();
        let m = k.registry().get::<LwMutex>(id).unwrap();
        let mut batch = WakeBatch::new();
        m.lock(&k, &mut batch, &t, 0).expect_done().unwrap();
        m.force_recursion_depth(u32::MAX);
        assert_eq!(m.lock(&k, &mut batch, &t, 0).expect_done(), Err(E_KRESOURCE));
        // The failed relock did not disturb the depth.
        assert_eq!(m.recursion_depth(), u32::MAX);
    }

    #[test]
    fn unlock_requires_ownership() {
        let k = kernel();
        let a = k.create_thread(1, 1000);
        let b = k.create_thread(2, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();
        assert_eq!(m.unlock(&k, &mut batch, &a), Err(E_PERM));
        m.lock(&k, &mut batch, &a, 0).expect_done().unwrap();
        assert_eq!(m.unlock(&k, &mut batch, &b), Err(E_PERM));
        assert_eq!(m.owner(), 1);
    }

    #[test]
    fn trylock_leaves_state_untouched_on_busy() {
        let k = kernel();
        let a = k.create_thread(1, 1000);
        let b = k.create_thread(2, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();
        m.lock(&k, &mut batch, &a, 0).expect_done().unwrap();

        let var = m.lock_var.load();
        assert_eq!(m.trylock(&k, &b), Err(E_BUSY));
        assert_eq!(m.lock_var.load(), var);
        assert_eq!(m.recursion_depth(), 0);
        assert_eq!(m.waiters(), 0);
    }

    #[test]
    fn destroy_while_held_elsewhere_is_busy() {
        let k = kernel();
        let a = k.create_thread(1, 1000);
        let b = k.create_thread(2, 1000);
        let m = fifo(&k);
        let mut batch = WakeBatch::new();
        m.lock(&k, &mut batch, &a, 0).expect_done().unwrap();
        assert_eq!(m.destroy(&k, &b), Err(E_BUSY));
        // Held by the caller itself is busy too.
        assert_eq!(m.destroy(&k, &a), Err(E_BUSY));
        m.unlock(&k, &mut batch, &a).unwrap();
        assert_eq!(m.destroy(&k, &b), Ok(()));
        assert!(k.registry().get::<LwMutex>(m.id()).is_none());
        assert_eq!(k.registry().count(ObjKind::Mutex), 0);

        // Stale handles observe the dead object.
        assert_eq!(m.trylock(&k, &a), Err(E_ESRCH));
        assert_eq!(m.lock(&k, &mut batch, &a, 0).expect_done(), Err(E_ESRCH));
    }
}
