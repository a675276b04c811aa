//! Error types for kernel compilation and launch.

use thiserror::Error;

use super::KernelHandle;
use crate::runtime::DeviceError;

/// Errors from the JIT compiler and kernel invoker.
#[derive(Error, Debug)]
pub enum JitError {
    /// No entry point could be located in the source text.
    #[error("malformed kernel source: {0}")]
    MalformedSource(String),

    /// Every compiler backend failed for this kernel on this device.
    #[error("failed to compile `{entry}` for device {device} (arch {arch}): {details}")]
    Compilation {
        entry: String,
        device: usize,
        arch: String,
        details: String,
    },

    /// Handle was never returned by `inject_source`.
    #[error("unknown kernel handle {0}")]
    UnknownHandle(KernelHandle),

    /// Device index outside the platform's range.
    #[error("invalid device {device}: platform has {device_count} devices")]
    InvalidDevice { device: usize, device_count: usize },

    /// A buffer argument lives on a different device than the launch.
    #[error("buffer {index} is on device {actual}, launch targets device {expected}")]
    DeviceMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Platform call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compilation_error_names_kernel_and_arch() {
        let err = JitError::Compilation {
            entry: "cumsum_fn".to_string(),
            device: 1,
            arch: "80".to_string(),
            details: "nvcc: not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cumsum_fn"));
        assert!(msg.contains("device 1"));
        assert!(msg.contains("arch 80"));
    }

    #[test]
    fn unknown_handle_display() {
        assert_eq!(
            JitError::UnknownHandle(KernelHandle(7)).to_string(),
            "unknown kernel handle #7"
        );
    }
}
