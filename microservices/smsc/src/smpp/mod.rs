//! SMPP v3.4: codec, server-side sessions and the outbound ESME client

pub mod client;
pub mod io;
pub mod pdu;
pub mod receipt;
pub mod server;
pub mod session;
pub mod time;

pub use client::{SmppClient, SmppClientConfig};
pub use pdu::{Bind, BindResp, Body, DecodeError, Pdu, SmBody, Tlv};
pub use server::{SessionRegistry, SmppServer};
pub use session::{BindState, Credentials, Session, SessionConfig, SubmitError, Submitter};

/// SMPP interface version advertised in bind responses
pub const INTERFACE_VERSION: u8 = 0x34;

/// Command identifiers
pub mod command {
    pub const GENERIC_NACK: u32 = 0x8000_0000;
    pub const BIND_RECEIVER: u32 = 0x0000_0001;
    pub const BIND_RECEIVER_RESP: u32 = 0x8000_0001;
    pub const BIND_TRANSMITTER: u32 = 0x0000_0002;
    pub const BIND_TRANSMITTER_RESP: u32 = 0x8000_0002;
    pub const SUBMIT_SM: u32 = 0x0000_0004;
    pub const SUBMIT_SM_RESP: u32 = 0x8000_0004;
    pub const DELIVER_SM: u32 = 0x0000_0005;
    pub const DELIVER_SM_RESP: u32 = 0x8000_0005;
    pub const UNBIND: u32 = 0x0000_0006;
    pub const UNBIND_RESP: u32 = 0x8000_0006;
    pub const BIND_TRANSCEIVER: u32 = 0x0000_0009;
    pub const BIND_TRANSCEIVER_RESP: u32 = 0x8000_0009;
    pub const ENQUIRE_LINK: u32 = 0x0000_0015;
    pub const ENQUIRE_LINK_RESP: u32 = 0x8000_0015;

    pub const RESPONSE_BIT: u32 = 0x8000_0000;

    pub fn name(command_id: u32) -> &'static str {
        match command_id {
            GENERIC_NACK => "generic_nack",
            BIND_RECEIVER => "bind_receiver",
            BIND_RECEIVER_RESP => "bind_receiver_resp",
            BIND_TRANSMITTER => "bind_transmitter",
            BIND_TRANSMITTER_RESP => "bind_transmitter_resp",
            SUBMIT_SM => "submit_sm",
            SUBMIT_SM_RESP => "submit_sm_resp",
            DELIVER_SM => "deliver_sm",
            DELIVER_SM_RESP => "deliver_sm_resp",
            UNBIND => "unbind",
            UNBIND_RESP => "unbind_resp",
            BIND_TRANSCEIVER => "bind_transceiver",
            BIND_TRANSCEIVER_RESP => "bind_transceiver_resp",
            ENQUIRE_LINK => "enquire_link",
            ENQUIRE_LINK_RESP => "enquire_link_resp",
            _ => "unknown",
        }
    }
}

/// command_status values
pub mod status {
    pub const ESME_ROK: u32 = 0x0000_0000;
    pub const ESME_RINVMSGLEN: u32 = 0x0000_0001;
    pub const ESME_RINVCMDLEN: u32 = 0x0000_0002;
    pub const ESME_RINVCMDID: u32 = 0x0000_0003;
    pub const ESME_RINVBNDSTS: u32 = 0x0000_0004;
    pub const ESME_RALYBND: u32 = 0x0000_0005;
    pub const ESME_RSYSERR: u32 = 0x0000_0008;
    pub const ESME_RINVSRCADR: u32 = 0x0000_000A;
    pub const ESME_RINVDSTADR: u32 = 0x0000_000B;
    pub const ESME_RBINDFAIL: u32 = 0x0000_000D;
    pub const ESME_RINVPASWD: u32 = 0x0000_000E;
    pub const ESME_RINVSYSID: u32 = 0x0000_000F;
    pub const ESME_RMSGQFUL: u32 = 0x0000_0014;
    pub const ESME_RTHROTTLED: u32 = 0x0000_0058;
    pub const ESME_RINVSCHED: u32 = 0x0000_0061;
    pub const ESME_RINVEXPIRY: u32 = 0x0000_0062;
}
