//! Error taxonomy of the gateway
//!
//! Each layer has its own enum; everything converts into `SmscError` at the
//! service edge.

use smsc_core::{OperatorId, SmscError};
use thiserror::Error;

use crate::smpp::DecodeError;

/// Failure of one SMPP session; ends only that session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Session closed")]
    Closed,

    #[error("Too many malformed PDUs")]
    TooManyMalformed,
}

/// Outcome of a failed send through a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Response timeout")]
    Timeout,

    #[error("Throttled by peer")]
    Throttled,

    #[error("Rejected by peer with status {0:#x}")]
    Rejected(u32),
}

impl TransportError {
    /// The path to the operator is down; the retry may go elsewhere
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ConnectionLost)
    }

    /// The peer refused the message itself; retrying cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl From<smsc_sigtran::SigtranError> for TransportError {
    fn from(err: smsc_sigtran::SigtranError) -> Self {
        use smsc_sigtran::errors::MapError;
        use smsc_sigtran::SigtranError;
        match err {
            SigtranError::Timeout => Self::Timeout,
            SigtranError::AssociationLost => Self::ConnectionLost,
            // MAP error codes come straight from the HLR/MSC
            SigtranError::Map(MapError::OperationError { code }) => Self::Rejected(code as u32),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("No route for destination {0}")]
    NoMatch(String),

    #[error("Invalid pattern '{0}'")]
    InvalidPattern(String),

    #[error("Unknown operator {0}")]
    UnknownOperator(OperatorId),

    #[error("Duplicate rule {0}")]
    DuplicateRule(String),

    #[error("Unknown rule {0}")]
    UnknownRule(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown operator {0}")]
    UnknownOperator(OperatorId),

    #[error("Operator {0} already exists")]
    DuplicateOperator(OperatorId),

    #[error("Invalid operator: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue for {operator} is full ({depth} entries)")]
    Backpressure { operator: OperatorId, depth: usize },

    #[error("No queue for operator {0}")]
    UnknownOperator(OperatorId),

    #[error("Message has no candidate operator")]
    NoCandidates,

    #[error("Queue is shutting down")]
    ShuttingDown,
}

impl From<SessionError> for SmscError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Io(e) => SmscError::Network(e.to_string()),
            other => SmscError::Protocol(other.to_string()),
        }
    }
}

impl From<TransportError> for SmscError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => SmscError::Timeout(err.to_string()),
            other => SmscError::Unavailable(other.to_string()),
        }
    }
}

impl From<RoutingError> for SmscError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::UnknownOperator(_) | RoutingError::UnknownRule(_) => {
                SmscError::NotFound(err.to_string())
            }
            other => SmscError::Validation(other.to_string()),
        }
    }
}

impl From<RegistryError> for SmscError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownOperator(_) => SmscError::NotFound(err.to_string()),
            other => SmscError::Validation(other.to_string()),
        }
    }
}

impl From<QueueError> for SmscError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Backpressure { .. } => SmscError::Backpressure(err.to_string()),
            QueueError::UnknownOperator(_) => SmscError::NotFound(err.to_string()),
            QueueError::NoCandidates => SmscError::Validation(err.to_string()),
            QueueError::ShuttingDown => SmscError::Unavailable(err.to_string()),
        }
    }
}
