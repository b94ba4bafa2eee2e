//! M3UA, RFC 4666: the TLV codec plus ASP state maintenance, usable from
//! either end of an association

mod asp;
mod codec;
mod messages;

pub use asp::{Asp, AspOutput, AspRole, AspState};
pub use codec::{decode, encode, encode_message, M3uaPdu, Parameter};
pub use messages::{M3uaMessage, ProtocolData};

/// Parameter tags this codec understands; anything else is carried through
/// as an opaque [`Parameter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ParameterTag {
    InfoString = 0x0004,
    RoutingContext = 0x0006,
    DiagnosticInfo = 0x0007,
    HeartbeatData = 0x0009,
    TrafficModeType = 0x000B,
    ErrorCode = 0x000C,
    Status = 0x000D,
    AspIdentifier = 0x0011,
    AffectedPointCode = 0x0012,
    CorrelationId = 0x0013,
    NetworkAppearance = 0x0200,
    ProtocolData = 0x0210,
}

impl ParameterTag {
    const ALL: [Self; 12] = [
        Self::InfoString,
        Self::RoutingContext,
        Self::DiagnosticInfo,
        Self::HeartbeatData,
        Self::TrafficModeType,
        Self::ErrorCode,
        Self::Status,
        Self::AspIdentifier,
        Self::AffectedPointCode,
        Self::CorrelationId,
        Self::NetworkAppearance,
        Self::ProtocolData,
    ];

    pub fn from_u16(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|known| *known as u16 == tag)
    }
}

/// Codes sent back in an M3UA ERR message
pub mod error_code {
    pub const UNEXPECTED_MESSAGE: u32 = 0x06;
    pub const PROTOCOL_ERROR: u32 = 0x07;
}
