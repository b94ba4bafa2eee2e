//! SCCP (Signaling Connection Control Part)
//!
//! Connectionless relay (UDT/XUDT/UDTS) and a connection table for class 2
//! peers. Routing is static: every remote has one adjacent point code.

mod address;
mod connection;
mod messages;

pub use address::{AddressIndicator, GlobalTitle, SccpAddress};
pub use connection::{
    ConnectionOutput, ConnectionState, ConnectionTable, SccpConnection, RELEASE_END_USER,
};
pub use messages::SccpMessage;

/// SCCP Message Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Cr = 0x01,   // Connection Request
    Cc = 0x02,   // Connection Confirm
    Cref = 0x03, // Connection Refused
    Rlsd = 0x04, // Released
    Rlc = 0x05,  // Release Complete
    Dt1 = 0x06,  // Data Form 1
    Udt = 0x09,  // Unitdata
    Udts = 0x0A, // Unitdata Service
    Xudt = 0x11, // Extended Unitdata
}

impl SccpMessage {
    /// True for the messages handled by the [`ConnectionTable`]
    pub fn is_connection_oriented(&self) -> bool {
        !matches!(
            self,
            Self::Udt { .. } | Self::Udts { .. } | Self::Xudt { .. }
        )
    }
}

/// UDTS return cause "subsystem failure"
pub const RETURN_SUBSYSTEM_FAILURE: u8 = 0x03;
