//! Guest synchronization primitives.

pub mod kmutex;
pub mod lwmutex;

pub use kmutex::KMutex;
pub use lwmutex::LwMutex;

use lv2_rt::{
    ErrorCode, E_INVAL, SYS_SYNC_ATTR_PROTOCOL_MASK, SYS_SYNC_ATTR_RECURSIVE_MASK, SYS_SYNC_FIFO,
    SYS_SYNC_NOT_RECURSIVE, SYS_SYNC_PRIORITY, SYS_SYNC_RECURSIVE, SYS_SYNC_RETRY,
};

use crate::sched::Protocol;

/// Validates a guest attribute word: one protocol nibble, one recursion
/// nibble, nothing else set. Returns (protocol, recursive).
pub fn parse_sync_attr(attr: u32) -> Result<(Protocol, bool), ErrorCode> {
    if attr & !(SYS_SYNC_ATTR_PROTOCOL_MASK | SYS_SYNC_ATTR_RECURSIVE_MASK) != 0 {
        return Err(E_INVAL);
    }
    let protocol = match attr & SYS_SYNC_ATTR_PROTOCOL_MASK {
        SYS_SYNC_FIFO => Protocol::Fifo,
        SYS_SYNC_PRIORITY => Protocol::Priority,
        SYS_SYNC_RETRY => Protocol::Retry,
        _ => return Err(E_INVAL),
    };
    let recursive = match attr & SYS_SYNC_ATTR_RECURSIVE_MASK {
        SYS_SYNC_RECURSIVE => true,
        SYS_SYNC_NOT_RECURSIVE => false,
        _ => return Err(E_INVAL),
    };
    Ok((protocol, recursive))
}
