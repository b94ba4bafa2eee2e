//! M3UA messages as the ASP exchanges them with its peer

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::M3uaError;
use crate::types::TrafficModeType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum M3uaMessage {
    // ASPSM
    AspUp {
        asp_identifier: Option<u32>,
        info_string: Option<String>,
    },
    AspUpAck {
        info_string: Option<String>,
    },
    AspDown {
        info_string: Option<String>,
    },
    AspDownAck {
        info_string: Option<String>,
    },
    Heartbeat {
        data: Bytes,
    },
    HeartbeatAck {
        data: Bytes,
    },

    // ASPTM
    AspActive {
        traffic_mode_type: Option<TrafficModeType>,
        routing_context: Vec<u32>,
        info_string: Option<String>,
    },
    AspActiveAck {
        traffic_mode_type: Option<TrafficModeType>,
        routing_context: Vec<u32>,
        info_string: Option<String>,
    },
    AspInactive {
        routing_context: Vec<u32>,
        info_string: Option<String>,
    },
    AspInactiveAck {
        routing_context: Vec<u32>,
        info_string: Option<String>,
    },

    // Transfer, carrying SCCP
    Data {
        network_appearance: Option<u32>,
        routing_context: Option<u32>,
        protocol_data: ProtocolData,
        correlation_id: Option<u32>,
    },

    // MGMT
    Error {
        error_code: u32,
        routing_context: Vec<u32>,
        diagnostic_info: Option<Bytes>,
    },
    Notify {
        status_type: u16,
        status_info: u16,
        routing_context: Vec<u32>,
        info_string: Option<String>,
    },

    // SSNM: remote point code reachability
    Duna {
        network_appearance: Option<u32>,
        routing_context: Vec<u32>,
        affected_point_code: Vec<u32>,
        info_string: Option<String>,
    },
    Dava {
        network_appearance: Option<u32>,
        routing_context: Vec<u32>,
        affected_point_code: Vec<u32>,
        info_string: Option<String>,
    },
}

/// The MTP3 routing label M3UA carries in place of MTP3, followed by the
/// user part payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolData {
    pub opc: u32,
    pub dpc: u32,
    /// Service indicator, 3 for SCCP
    pub si: u8,
    pub ni: u8,
    pub mp: u8,
    /// Link selection; this stack uses it to pin a dialogue to one stream
    pub sls: u8,
    pub data: Bytes,
}

impl ProtocolData {
    pub fn sccp(opc: u32, dpc: u32, ni: u8, sls: u8, data: Bytes) -> Self {
        Self {
            opc,
            dpc,
            si: crate::SI_SCCP,
            ni,
            mp: 0,
            sls,
            data,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(12 + self.data.len());
        buf.put_u32(self.opc);
        buf.put_u32(self.dpc);
        buf.put_u8(self.si);
        buf.put_u8(self.ni);
        buf.put_u8(self.mp);
        buf.put_u8(self.sls);
        buf.put_slice(&self.data);
        buf
    }

    pub fn decode(mut data: Bytes) -> Result<Self, M3uaError> {
        if data.remaining() < 12 {
            return Err(M3uaError::InvalidMessage(format!(
                "protocol data of {} bytes",
                data.remaining()
            )));
        }

        Ok(Self {
            opc: data.get_u32(),
            dpc: data.get_u32(),
            si: data.get_u8(),
            ni: data.get_u8(),
            mp: data.get_u8(),
            sls: data.get_u8(),
            data,
        })
    }
}

impl M3uaMessage {
    /// Message class, message type and log name (RFC 4666 §3.1.2)
    fn header(&self) -> (u8, u8, &'static str) {
        match self {
            Self::Error { .. } => (0, 0, "ERR"),
            Self::Notify { .. } => (0, 1, "NTFY"),
            Self::Data { .. } => (1, 1, "DATA"),
            Self::Duna { .. } => (2, 1, "DUNA"),
            Self::Dava { .. } => (2, 2, "DAVA"),
            Self::AspUp { .. } => (3, 1, "ASPUP"),
            Self::AspDown { .. } => (3, 2, "ASPDN"),
            Self::Heartbeat { .. } => (3, 3, "BEAT"),
            Self::AspUpAck { .. } => (3, 4, "ASPUP_ACK"),
            Self::AspDownAck { .. } => (3, 5, "ASPDN_ACK"),
            Self::HeartbeatAck { .. } => (3, 6, "BEAT_ACK"),
            Self::AspActive { .. } => (4, 1, "ASPAC"),
            Self::AspInactive { .. } => (4, 2, "ASPIA"),
            Self::AspActiveAck { .. } => (4, 3, "ASPAC_ACK"),
            Self::AspInactiveAck { .. } => (4, 4, "ASPIA_ACK"),
        }
    }

    pub fn class(&self) -> u8 {
        self.header().0
    }

    pub fn message_type(&self) -> u8 {
        self.header().1
    }

    pub fn name(&self) -> &'static str {
        self.header().2
    }
}
