use std::fmt::Display;

/// A specialized error type for scheduler operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// A worker thread panicked while evaluating a task.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
    /// A task returned an error from one of its steps.
    #[error("task failed: {0}")]
    Task(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The scheduler was cancelled before the stream completed.
    #[error("cancelled")]
    Cancelled,
}

impl SchedError {
    /// Create a task error from any error value.
    pub fn task<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Task(Box::new(err))
    }

    /// Create a task error from a displayable message.
    pub fn task_msg<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Task(msg.to_string().into())
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }
}

/// A Result type alias for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = SchedError::invalid_config("bad rate");
        assert!(matches!(err, SchedError::InvalidConfig(msg) if msg == "bad rate"));
    }

    #[test]
    fn task_msg_displays_source() {
        let err = SchedError::task_msg("boom");
        assert_eq!(err.to_string(), "task failed: boom");
    }
}
