//! The guest-OS kernel core of a console emulator: kernel object
//! registry, cooperative thread scheduler, and the hybrid
//! synchronization primitives built on both.
//!
//! Guest threads run on host threads; the scheduler only decides which
//! of them may run at a time and parks the rest. Every blocking syscall
//! is resumable: when a savestate is requested, blocked calls unwind to
//! a recorded resumption point and replay transparently afterwards.

pub mod config;
pub mod idm;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod util;

use std::sync::Arc;

pub use config::Config;
pub use idm::{IpcFlags, ObjKind, ObjectId, Pshared, Registry};
pub use sched::{AwakeArg, Protocol, Scheduler, WaitResult, WakeBatch};
pub use thread::{ResumePoint, Thread, ThreadFlags};

/// One emulated kernel instance. All syscall-level entry points take
/// `&Kernel` plus the calling [`Thread`].
pub struct Kernel {
    config: Config,
    registry: Registry,
    sched: Scheduler,
}

impl Kernel {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Registry::new(config.max_objects, config.ipc_key_required);
        let sched = Scheduler::new(&config);
        log::info!(
            "kernel up: window={} objects={}",
            config.ppu_threads,
            config.max_objects
        );
        Arc::new(Self {
            config,
            registry,
            sched,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// Spawns the kernel-side identity of a guest thread and makes it
    /// runnable.
    pub fn create_thread(&self, id: u32, prio: i32) -> Arc<Thread> {
        let thread = Thread::new(id, prio);
        self.sched.register(&thread);
        thread
    }

    pub fn retire_thread(&self, thread: &Arc<Thread>) {
        self.sched.retire(thread);
    }

    /// Emulator teardown.
    pub fn shutdown(&self) {
        self.sched.cleanup();
        log::info!("kernel down");
    }
}
