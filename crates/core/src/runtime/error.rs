//! Error types for device runtime operations.

use thiserror::Error;

/// Errors raised by a [`super::DeviceRuntime`] implementation.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A vendor library could not be loaded or a symbol was missing.
    #[error("failed to load {library}: {message}")]
    LibraryLoad { library: String, message: String },

    /// A driver or runtime call returned a non-success code.
    #[error("{op} failed: {message} ({code})")]
    Driver {
        op: String,
        code: i32,
        message: String,
    },

    /// Device ordinal outside the range reported by the platform.
    #[error("invalid device {device}: platform has {device_count} devices")]
    InvalidDevice { device: usize, device_count: usize },

    /// Buffer memory kind does not match the runtime it was handed to.
    #[error("buffer on {actual} memory cannot be used by the {expected} runtime")]
    MemoryKind {
        expected: &'static str,
        actual: &'static str,
    },

    /// Buffer byte length does not match the data supplied for it.
    #[error("buffer size mismatch: buffer holds {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The kernel image cannot be loaded by this runtime.
    #[error("unsupported kernel image for {runtime}: {reason}")]
    UnsupportedImage {
        runtime: &'static str,
        reason: String,
    },

    /// Host platform has no implementation registered for an entry point.
    #[error("no host implementation registered for kernel `{0}`")]
    MissingHostKernel(String),

    /// A host kernel rejected its arguments.
    #[error("kernel `{entry}` rejected its arguments: {reason}")]
    InvalidArguments { entry: String, reason: String },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = DeviceError::Driver {
            op: "cuModuleLoadDataEx".to_string(),
            code: 218,
            message: "a PTX JIT compilation failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cuModuleLoadDataEx failed: a PTX JIT compilation failed (218)"
        );
    }

    #[test]
    fn missing_host_kernel_display() {
        let err = DeviceError::MissingHostKernel("vector_scale".to_string());
        assert!(err.to_string().contains("vector_scale"));
    }
}
