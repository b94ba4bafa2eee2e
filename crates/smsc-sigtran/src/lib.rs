//! # SMSC SIGTRAN Stack
//!
//! SS7 over IP for the SMS gateway:
//!
//! - **SCTP** - association state machine, chunk codec, carried over TCP framing
//! - **M3UA** - ASP state maintenance and MTP3 user data transfer
//! - **SCCP** - connectionless relay (UDT/XUDT) plus a connection table
//! - **TCAP** - the Begin/End/Abort subset needed to carry MAP
//! - **MAP** - MO/MT-ForwardSM and the SMS TPDUs they carry
//!
//! [`SigtranStack`] ties the layers together: one association task per
//! configured remote signaling point, relaying gateway [`smsc_core::Message`]s
//! to and from MAP.

pub mod config;
pub mod errors;
pub mod m3ua;
pub mod map;
pub mod sccp;
pub mod sctp;
pub mod stack;
pub mod tcap;
pub mod types;

pub use config::{LocalConfig, RemoteConfig, RemoteMode, SigtranConfig};
pub use errors::{Result, SigtranError};
pub use stack::{RemoteState, SigtranStack, SubmitReceipt};
pub use types::*;

/// IANA port for M3UA
pub const DEFAULT_M3UA_PORT: u16 = 2905;

/// MTP3 service indicator carried in M3UA protocol data for SCCP
pub const SI_SCCP: u8 = 3;

/// SCCP subsystem numbers this gateway addresses
pub mod ssn {
    pub const MSC: u8 = 8;
    pub const SMSC: u8 = 8;
}
