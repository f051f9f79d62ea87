use std::time::Duration;

use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [crate::Debuggable].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The address is outside any region mapped by the target.
    #[error("address {address:#x} is not mapped by {target}")]
    InvalidAddress { target: String, address: u64 },

    /// The register name is not part of the target architecture.
    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    /// The memory range is not mapped for the target.
    #[error("memory {address:#x}+{length:#x} is not accessible on {target}")]
    InaccessibleMemory {
        target: String,
        address: u64,
        length: usize,
    },

    /// The target did not stop at the breakpoint within the allotted time.
    #[error("{target} did not stop at {address:#x} within {timeout:?}")]
    Timeout {
        target: String,
        address: u64,
        timeout: Duration,
    },

    /// The connection to the target dropped.
    #[error("lost connection to {target}: {reason}")]
    TargetLost { target: String, reason: String },

    /// A register vector does not match the register set it is applied to. Register transfer is
    /// all-or-nothing so this is always a protocol error.
    #[error("register set mismatch: expected {expected} registers, found {actual}")]
    RegisterSetMismatch { expected: usize, actual: usize },

    /// The register set definition itself is invalid.
    #[error("invalid register set: {0}")]
    InvalidRegisterSet(String),

    /// The operation is not valid in the current target state, such as waiting on a target that
    /// was never continued.
    #[error("{target}: {message}")]
    InvalidState { target: String, message: String },
}

impl Error {
    /// Whether this error reports loss of the underlying connection.
    pub fn is_target_lost(&self) -> bool {
        matches!(self, Error::TargetLost { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
