//! Error types for the Gantry runtime.

use thiserror::Error;

/// Errors that can occur in the Gantry runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Program source or binary not found at the specified path.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Failed to decode bytecode.
    #[error("Bytecode error: {0}")]
    BytecodeError(String),

    /// Bytecode decoded but failed structural validation.
    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    /// A script raised an error or an instruction could not be executed.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// A call referenced a function the program does not define.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A call referenced a native function that is not registered.
    #[error("Unknown native function: {0}")]
    UnknownNative(String),

    /// The step ceiling of the budget was exceeded.
    #[error("Step limit exceeded: {limit}")]
    StepLimitExceeded { limit: u64 },

    /// The allocation ceiling of the budget was exceeded.
    #[error("Allocation limit exceeded: {limit}")]
    AllocationLimitExceeded { limit: u64 },

    /// The call depth ceiling of the budget was exceeded.
    #[error("Frame limit exceeded: {limit}")]
    FrameLimitExceeded { limit: u32 },

    /// Error raised by a host (native) function.
    #[error(transparent)]
    Host(Box<dyn std::error::Error + Send + Sync>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// True when the error means the budget ran out.
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(
            self,
            RuntimeError::StepLimitExceeded { .. }
                | RuntimeError::AllocationLimitExceeded { .. }
                | RuntimeError::FrameLimitExceeded { .. }
        )
    }

    /// True when the error is a missing file or program.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::PluginNotFound(_) => true,
            RuntimeError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
