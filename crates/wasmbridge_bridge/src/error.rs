//! The single error channel handed back to platform shells.

use crate::marshal::MarshalError;
use wasmbridge_core::{InstanceId, ModuleId};
use wasmbridge_wasm::{InstantiationError, InvokeError, LoadError};

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Everything that can go wrong behind the bridge
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Module bytes rejected
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    /// Instantiation failed
    #[error("Instantiation failed: {0}")]
    Instantiate(#[from] InstantiationError),

    /// Invocation failed
    #[error("{0}")]
    Invoke(#[from] InvokeError),

    /// Native arguments rejected
    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Module handle not registered
    #[error("Unknown module {0}")]
    UnknownModule(ModuleId),

    /// Instance handle not registered
    #[error("Unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// Export returned something other than expected
    #[error("Unexpected result from {export}: {reason}")]
    UnexpectedResult {
        /// Export name
        export: String,
        /// What was wrong
        reason: String,
    },

    /// Async call exceeded its deadline; the interpreter was cancelled
    #[error("Call to {export} timed out after {timeout_ms}ms")]
    Timeout {
        /// Export name
        export: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Asset could not be read
    #[error("Cannot read asset {path}: {reason}")]
    Asset {
        /// Asset path
        path: String,
        /// I/O error
        reason: String,
    },

    /// Configuration could not be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Worker task failed to complete
    #[error("Task failed: {0}")]
    Task(String),
}

impl BridgeError {
    /// Stable machine-readable code, for promise rejections and C callers
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Load(_) => "LOAD_ERROR",
            Self::Instantiate(InstantiationError::Link(_)) => "LINK_ERROR",
            Self::Instantiate(_) => "INSTANTIATION_ERROR",
            Self::Invoke(InvokeError::TypeMismatch { .. }) => "TYPE_MISMATCH",
            Self::Invoke(InvokeError::Trap(_)) => "TRAP",
            Self::Marshal(_) => "MARSHAL_ERROR",
            Self::UnknownModule(_) | Self::UnknownInstance(_) => "UNKNOWN_HANDLE",
            Self::UnexpectedResult { .. } | Self::Task(_) => "WASM_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Asset { .. } => "ASSET_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}
