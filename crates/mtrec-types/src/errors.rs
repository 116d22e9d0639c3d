use thiserror::Error;

/// Main error type for MTRec
#[derive(Error, Debug)]
pub enum MtError {
    #[error("Validation error in `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported optimizer `{name}` (expected one of: sgd, adam, adamw)")]
    UnsupportedOptimizer { name: String },

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Training failed: {0}")]
    Training(String),

    #[error("All {n_trials} trials failed")]
    AllTrialsFailed { n_trials: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MtError {
    /// Errors that end the current trial but must not end a search.
    pub fn is_trial_scoped(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Training(_))
    }

    /// Errors that only invalidate the batch being processed.
    pub fn is_batch_error(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// Configuration field responsible for the error, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::UnsupportedOptimizer { .. } => Some("trainer.optimizer"),
            _ => None,
        }
    }
}

/// Per-batch errors. The batch is skipped and training continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Malformed batch: {message}")]
    Malformed { message: String },

    #[error("Missing loss for active task `{task}`")]
    MissingTaskLoss { task: String },

    #[error("Non-finite loss for task `{task}`: {value}")]
    NonFiniteLoss { task: String, value: f64 },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },
}

/// Accelerator failures. Fatal for the running trial.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Out of memory on {device}: {message}")]
    OutOfMemory { device: String, message: String },

    #[error("Device {device} unavailable: {message}")]
    Unavailable { device: String, message: String },

    #[error("Kernel execution failed: {message}")]
    Execution { message: String },
}

/// Result type alias for MTRec operations
pub type MtResult<T> = Result<T, MtError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($field:expr, $($arg:tt)*) => {
        $crate::MtError::Validation {
            field: ($field).to_string(),
            message: format!($($arg)*),
        }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::MtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MtError::Configuration(format!($($arg)*))
    };
}
