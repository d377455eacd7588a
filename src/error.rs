//! Error type shared by graph construction, compilation and execution.

use std::fmt;

use thiserror::Error;

use crate::types::DType;

/// Raw status code reported by the vendor graph compiler for a single
/// node-creation call. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorStatus(pub i32);

impl VendorStatus {
    pub const SUCCESS: VendorStatus = VendorStatus(0);
    /// Generic failure code used when the collaborator cannot say more.
    pub const FAIL: VendorStatus = VendorStatus(26);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        got: String,
    },
    #[error("invalid config: {0}")]
    ConfigError(String),
    #[error("graph construction failed at step {step} ({name}): {status}")]
    GraphConstruction {
        step: usize,
        name: String,
        status: VendorStatus,
    },
    #[error("unsupported dtype {0}")]
    UnsupportedDType(DType),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl Into<String>,
        got: impl fmt::Debug,
    ) -> Self {
        KernelError::ShapeMismatch {
            context,
            expected: expected.into(),
            got: format!("{got:?}"),
        }
    }

    /// Whether the error was raised before any node was created.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            KernelError::ShapeMismatch { .. }
                | KernelError::ConfigError(_)
                | KernelError::UnsupportedDType(_)
        )
    }
}
