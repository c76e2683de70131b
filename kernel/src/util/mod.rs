mod spin_lock;

pub use spin_lock::LockGuard;
pub use spin_lock::SpinLock;
