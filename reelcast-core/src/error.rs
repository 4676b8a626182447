use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error(
        "Quorum not reached for {operation}: {successes} of {required} required nodes"
    )]
    Quorum {
        operation: &'static str,
        successes: usize,
        required: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Cancellation is control flow, not a failure, and must never surface
    /// as a `Fail` worker event.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled(_))
    }

    /// True for errors caused by the backing store being unreachable.
    pub fn is_backend_unavailable(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            CoreError::Backend(_) => true,
            CoreError::Unavailable(_) | CoreError::Quorum { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
