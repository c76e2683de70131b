//! Guest-visible runtime constants for the LV2 kernel core.
//!
//! This crate holds everything a guest program can observe through the
//! syscall ABI: error codes, synchronization attribute bits, the IPC
//! creation flags and the scheduler priority window. The kernel crate
//! depends on it; nothing here depends on the kernel.

pub mod error;
pub use error::*;

/// Wake protocol bits of a sync attribute word (low nibble).
pub const SYS_SYNC_FIFO: u32 = 0x1;
pub const SYS_SYNC_PRIORITY: u32 = 0x2;
pub const SYS_SYNC_RETRY: u32 = 0x5;
pub const SYS_SYNC_ATTR_PROTOCOL_MASK: u32 = 0xf;

/// Recursion bits of a sync attribute word (second nibble).
pub const SYS_SYNC_RECURSIVE: u32 = 0x10;
pub const SYS_SYNC_NOT_RECURSIVE: u32 = 0x20;
pub const SYS_SYNC_ATTR_RECURSIVE_MASK: u32 = 0xf0;

/// IPC creation flags: how `create` treats an existing key registration.
pub const SYS_SYNC_NEWLY_CREATED: u32 = 0x1;
pub const SYS_SYNC_NOT_CREATE: u32 = 0x2;
pub const SYS_SYNC_NOT_CARE: u32 = 0x3;

/// The legal PPU priority window. Values outside it are an emulator bug,
/// not a guest error.
pub const PRIO_MIN: i32 = 0;
pub const PRIO_MAX: i32 = 3071;

/// The result of a guest syscall.
///
/// `Again` is not an error: it means the operation was interrupted at a
/// safe point (e.g. for a savestate) and must be replayed by the caller
/// once the thread is scheduled again. A function that returns `Again`
/// has stashed a resumption record on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SysResult<T> {
    Ok(T),
    Err(ErrorCode),
    Again,
}

impl<T> SysResult<T> {
    pub fn is_again(&self) -> bool {
        matches!(self, SysResult::Again)
    }

    /// Collapses into a plain `Result`; `Again` is a caller bug here.
    pub fn expect_done(self) -> Result<T, ErrorCode> {
        match self {
            SysResult::Ok(val) => Ok(val),
            SysResult::Err(code) => Err(code),
            SysResult::Again => panic!("syscall returned 'again' where a result was required"),
        }
    }
}

impl<T> From<Result<T, ErrorCode>> for SysResult<T> {
    fn from(result: Result<T, ErrorCode>) -> Self {
        match result {
            Ok(val) => SysResult::Ok(val),
            Err(code) => SysResult::Err(code),
        }
    }
}
