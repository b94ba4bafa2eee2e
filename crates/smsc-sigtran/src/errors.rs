//! Errors for each SIGTRAN layer, folded into [`SigtranError`] at the stack

use smsc_core::SmscError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SigtranError>;

#[derive(Debug, Error)]
pub enum SigtranError {
    #[error("sctp: {0}")]
    Sctp(#[from] SctpError),

    #[error("m3ua: {0}")]
    M3ua(#[from] M3uaError),

    #[error("sccp: {0}")]
    Sccp(#[from] SccpError),

    #[error("tcap: {0}")]
    Tcap(#[from] TcapError),

    #[error("map: {0}")]
    Map(#[from] MapError),

    #[error("tpdu: {0}")]
    Encoding(#[from] EncodingError),

    #[error("sigtran config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no remote named {0}")]
    UnknownRemote(String),

    #[error("remote {0} has no active ASP")]
    NotActive(String),

    #[error("no answer from remote")]
    Timeout,

    #[error("association went down mid-dialogue")]
    AssociationLost,

    #[error("stack stopping")]
    ShuttingDown,
}

impl SigtranError {
    /// The path to the peer failed, as opposed to the peer answering with an
    /// error; another operator may still succeed
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Sctp(_)
                | Self::Io(_)
                | Self::NotActive(_)
                | Self::AssociationLost
                | Self::ShuttingDown
                | Self::UnknownRemote(_)
        )
    }
}

impl From<SigtranError> for SmscError {
    fn from(err: SigtranError) -> Self {
        match err {
            SigtranError::Config(msg) => Self::Config(msg),
            SigtranError::Timeout => Self::Timeout(err.to_string()),
            SigtranError::Io(e) => e.into(),
            other if other.is_transport() => Self::Unavailable(other.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SctpError {
    #[error("association setup failed: {0}")]
    AssociationFailed(String),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("bad CRC32c {actual:#010x}, computed {expected:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("verification tag does not match the association")]
    VerificationTag,

    #[error("peer stopped answering heartbeats")]
    HeartbeatTimeout,

    #[error("peer sent ABORT")]
    Aborted,

    #[error("stream {0} outside negotiated range")]
    InvalidStream(u16),

    #[error("{actual} while {expected} was required")]
    InvalidState { expected: String, actual: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum M3uaError {
    #[error("ASP state: {0}")]
    AspStateError(String),

    #[error("bad message: {0}")]
    InvalidMessage(String),

    #[error("class {class} type {msg_type} not handled")]
    Unsupported { class: u8, msg_type: u8 },
}

#[derive(Debug, Error)]
pub enum SccpError {
    #[error("party address: {0}")]
    AddressError(String),

    #[error("bad message: {0}")]
    InvalidMessage(String),

    #[error("no connection with local reference {0}")]
    UnknownReference(u32),

    #[error("message returned, cause {0}")]
    Returned(u8),
}

#[derive(Debug, Error)]
pub enum TcapError {
    #[error("asn.1: {0}")]
    Asn1Error(String),

    #[error("unexpected tag {0:#04x}")]
    UnexpectedTag(u8),

    #[error("component: {0}")]
    ComponentError(String),

    #[error("dialogue aborted, cause {0:?}")]
    Aborted(Option<u8>),
}

#[derive(Debug, Error)]
pub enum MapError {
    /// A ReturnError component; codes are the MAP localValue errors
    #[error("remote returned error {code}")]
    OperationError { code: i32 },

    #[error("operation code {0} not supported")]
    UnsupportedOperation(i32),

    #[error("bad argument: {0}")]
    Malformed(String),

    #[error("invoke rejected, problem {0}")]
    Rejected(u8),

    #[error(transparent)]
    Tcap(#[from] TcapError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// TPDU and digit-string encoding failures
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("data coding scheme {0:#04x} not supported")]
    UnsupportedDcs(u8),

    #[error("{0:?} has no GSM 03.38 encoding")]
    InvalidGsm7Char(char),

    #[error("truncated")]
    BufferTooShort,

    #[error("non-decimal TBCD digit")]
    InvalidBcd,
}
