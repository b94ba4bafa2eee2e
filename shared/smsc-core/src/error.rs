//! The error every SMSC layer eventually converts into

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SmscError>;

#[derive(Error, Debug)]
pub enum SmscError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store: {0}")]
    Database(String),

    #[error("network: {0}")]
    Network(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("rejected: {0}")]
    Validation(String),

    #[error("queue full: {0}")]
    Backpressure(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl SmscError {
    /// HTTP status and stable machine code for the admin surface
    fn classify(&self) -> (u16, &'static str) {
        match self {
            Self::Config(_) => (500, "CONFIG_ERROR"),
            Self::Database(_) => (500, "DATABASE_ERROR"),
            Self::Network(_) => (500, "NETWORK_ERROR"),
            Self::NotFound(_) => (404, "NOT_FOUND"),
            Self::Validation(_) => (400, "VALIDATION_ERROR"),
            Self::Backpressure(_) => (429, "BACKPRESSURE"),
            Self::Unavailable(_) => (503, "UNAVAILABLE"),
            Self::Protocol(_) => (502, "PROTOCOL_ERROR"),
            Self::Timeout(_) => (504, "TIMEOUT"),
            Self::Internal(_) => (500, "INTERNAL_ERROR"),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.classify().0
    }

    pub fn error_code(&self) -> &'static str {
        self.classify().1
    }

    /// Worth retrying later without changing the request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Backpressure(_) | Self::Unavailable(_) | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for SmscError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SmscError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}
