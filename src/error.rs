use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Participant aborted: {0}")]
    ParticipantAbort(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether the error is caused by the caller rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FleetError::Validation(_) | FleetError::NotFound(_) | FleetError::Conflict(_)
        )
    }

    /// Whether the error represents an unreachable peer or expired deadline.
    pub fn is_transport(&self) -> bool {
        matches!(self, FleetError::Transport(_) | FleetError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

// Error conversions for common error types

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FleetError::Timeout(e.to_string())
        } else {
            FleetError::Transport(e.to_string())
        }
    }
}
