pub type ErrorCode = u16;

pub const E_OK: u16 = 0;
pub const E_AGAIN: u16 = 1; // Recoverable exhaustion (e.g. object table full).
pub const E_INVAL: u16 = 2; // Malformed arguments, detected before any mutation.
pub const E_BUSY: u16 = 3; // Trylock contention, or a RETRY-protocol bounce.
pub const E_TIMEDOUT: u16 = 4;
pub const E_DEADLK: u16 = 5; // Non-recursive self-relock.
pub const E_PERM: u16 = 6; // Unlock by a non-owner.
pub const E_EXIST: u16 = 7; // IPC key already registered.
pub const E_NOENT: u16 = 8; // IPC key not registered.
pub const E_ESRCH: u16 = 9; // Object concurrently destroyed.
pub const E_KRESOURCE: u16 = 10; // Kernel resource limit (e.g. recursion overflow).

pub fn error_name(code: ErrorCode) -> &'static str {
    match code {
        E_OK => "OK",
        E_AGAIN => "AGAIN",
        E_INVAL => "INVAL",
        E_BUSY => "BUSY",
        E_TIMEDOUT => "TIMEDOUT",
        E_DEADLK => "DEADLK",
        E_PERM => "PERM",
        E_EXIST => "EXIST",
        E_NOENT => "NOENT",
        E_ESRCH => "ESRCH",
        E_KRESOURCE => "KRESOURCE",
        _ => "(unknown)",
    }
}
