//! Crate-wide error type for lattice-engine.
//!
//! Every error kind named by the core's error handling design has a variant
//! here. Module-local error enums (`config::ConfigError`,
//! `cluster::protocol::ProtocolError`, ...) convert into this one at the
//! boundary where they cross into `Runtime`-facing code.

use thiserror::Error;

/// Crate-wide result alias.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("no GPU platform available")]
    NoGpuPlatform,

    #[error("kernel build failed: {log}")]
    KernelBuildFailed { log: String },

    #[error("unsupported opcode: {opcode}")]
    UnsupportedOpcode { opcode: String },

    #[error("user-defined functions are not supported by this core")]
    UnsupportedUserfunc,

    #[error("shape mismatch: batch expects {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("read/write conflict on base {base:?} within the active batch")]
    RwConflict { base: u64 },

    #[error("write conflict on base {base:?}: already claimed by a different view")]
    WriteConflict { base: u64 },

    #[error("unknown dispatch message type: {tag}")]
    UnknownMessage { tag: u32 },

    #[error("collective operation failed: {reason}")]
    CollectiveFailed { reason: String },

    #[error("device error: {reason}")]
    GenericDeviceError { reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CoreError {
    /// Whether this error is fatal to the whole process, per the
    /// propagation policy: `OutOfMemory`, `NoGpuPlatform`,
    /// `CollectiveFailed`, and `UnknownMessage` terminate the process;
    /// everything else is locally recovered or surfaced to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::OutOfMemory
                | CoreError::NoGpuPlatform
                | CoreError::CollectiveFailed { .. }
                | CoreError::UnknownMessage { .. }
        )
    }

    /// Process exit code, mirroring `CPHVB_ERROR`: 0 for a clean run,
    /// non-zero for any unrecoverable condition.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(CoreError::OutOfMemory.is_fatal());
        assert!(CoreError::NoGpuPlatform.is_fatal());
        assert!(CoreError::CollectiveFailed {
            reason: "x".into()
        }
        .is_fatal());
        assert!(CoreError::UnknownMessage { tag: 9 }.is_fatal());
    }

    #[test]
    fn recoverable_kinds() {
        assert!(!CoreError::RwConflict { base: 1 }.is_fatal());
        assert!(!CoreError::WriteConflict { base: 1 }.is_fatal());
        assert!(!CoreError::ShapeMismatch {
            expected: vec![4],
            actual: vec![5]
        }
        .is_fatal());
        assert!(!CoreError::UnsupportedOpcode {
            opcode: "FOO".into()
        }
        .is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CoreError::OutOfMemory.exit_code(), 1);
        assert_eq!(CoreError::UnsupportedUserfunc.exit_code(), 0);
    }
}
