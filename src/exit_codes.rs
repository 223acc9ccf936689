//! Exit code constants for the dlmcore CLI.
//!
//! - 0: Success
//! - 1: User error (bad args, invalid config or script)
//! - 2: Lock refused (unknown resource, not a holder, conversion in progress)
//! - 3: Retryable (master changed, stale generation)
//! - 4: Master unreachable or timed out
//! - 5: Protocol error (transport or malformed message)

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// User error: bad arguments, invalid config or scenario script.
pub const USER_ERROR: i32 = 1;

/// The lock manager refused the operation.
pub const LOCK_REFUSED: i32 = 2;

/// The request may be resubmitted unchanged.
pub const RETRYABLE: i32 = 3;

/// No answer from the master within the allowed time.
pub const UNREACHABLE: i32 = 4;

/// Transport failure or malformed wire frame.
pub const PROTOCOL_ERROR: i32 = 5;
