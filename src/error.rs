//! Crate-wide error types.
//!
//! Grounded on `routinator::error`: a `Failed` marker for operations that
//! have already logged their own diagnostics, and a small enum carrying
//! just enough information to pick a process exit code.

use log::error;

//------------ Failed --------------------------------------------------------

/// An operation failed; the failure has already been logged.
///
/// Used for the recoverable, per-session failure paths
/// (parse errors, hash mismatches, bad HTTP statuses): the session that
/// failed is retired with `END ok=0`, the engine itself keeps running.
#[derive(Clone, Copy, Debug)]
pub struct Failed;

//------------ FatalError -----------------------------------------------------

/// A violation of the parent/engine protocol, or an unrecoverable resource
/// failure. Both are bugs, not network faults, and terminate the process.
#[derive(Clone, Copy, Debug, Display)]
pub enum FatalError {
    /// An unexpected tag, unknown session id, fd where none was expected (or
    /// vice versa), or a message that arrived in a state that doesn't allow
    /// it.
    #[display("protocol invariant violated")]
    ProtocolViolation,

    /// The control channel was closed (POLLHUP) while a write was pending,
    /// or a read/write syscall returned an error the engine can't recover
    /// from.
    #[display("control channel failed")]
    ChannelFailed,

    /// Allocation failure or other resource exhaustion.
    #[display("allocation failure")]
    Alloc,
}

impl FatalError {
    /// The process exit code to use for this error.
    pub fn exit_code(self) -> i32 {
        match self {
            FatalError::ProtocolViolation => 2,
            FatalError::ChannelFailed => 3,
            FatalError::Alloc => 4,
        }
    }
}

impl From<Failed> for FatalError {
    fn from(_: Failed) -> FatalError {
        error!("Fatal error. Exiting.");
        FatalError::ProtocolViolation
    }
}

impl std::error::Error for FatalError {}
