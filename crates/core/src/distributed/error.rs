//! Error types for distributed operations.

use thiserror::Error;

use crate::jit::JitError;
use crate::ops::OpsError;
use crate::runtime::DeviceError;

/// Errors that can occur during communicator setup, collectives and exchanges.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Buffer sizes disagree for a collective operation.
    #[error("{op}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Buffer element types disagree for a collective operation.
    #[error("{op}: dtype mismatch, expected {expected}, got {actual}")]
    DtypeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// Split parameters are inconsistent with the group or the buffers.
    #[error("invalid split: {0}")]
    InvalidSplit(String),

    /// Event slot index beyond the pool capacity.
    #[error("event slot {slot} out of range: pool holds {capacity} slots")]
    EventSlotOutOfRange { slot: usize, capacity: usize },

    /// Group establishment did not complete in time. Retry with a fresh id.
    #[error("rendezvous timed out after {timeout_ms}ms")]
    RendezvousTimeout { timeout_ms: u64 },

    /// Out-of-band id exchange failed.
    #[error("rendezvous failed: {0}")]
    Rendezvous(String),

    /// Operation needs a communicator that has not been initialized.
    #[error("{0} communicator is not initialized")]
    NotInitialized(&'static str),

    /// Communicator initialized twice in one context.
    #[error("{0} communicator is already initialized")]
    AlreadyInitialized(&'static str),

    /// NCCL operation failed.
    #[error("NCCL error: {0}")]
    NcclError(String),

    /// Simulated transport failure (peer never posted, size disagreement).
    #[error("transport error: {0}")]
    Transport(String),

    /// Buffer lives on a different device than the communicator.
    #[error("buffer on device {actual}, communicator bound to device {expected}")]
    DeviceMismatch { expected: usize, actual: usize },

    /// Platform call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Kernel compilation or launch failed.
    #[error(transparent)]
    Jit(#[from] JitError),

    /// Point operator failed.
    #[error(transparent)]
    Ops(#[from] OpsError),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_names_operation() {
        let err = DistributedError::ShapeMismatch {
            op: "batch_all_to_all_variable",
            expected: vec![4],
            actual: vec![6],
        };
        assert_eq!(
            err.to_string(),
            "batch_all_to_all_variable: shape mismatch, expected [4], got [6]"
        );
    }

    #[test]
    fn device_errors_convert() {
        let err: DistributedError = DeviceError::MissingHostKernel("k".to_string()).into();
        assert!(matches!(err, DistributedError::Device(_)));
        let err: DistributedError = JitError::MalformedSource("x".to_string()).into();
        assert!(matches!(err, DistributedError::Jit(_)));
    }

    #[test]
    fn timeout_display() {
        let err = DistributedError::RendezvousTimeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "rendezvous timed out after 1500ms");
    }
}
