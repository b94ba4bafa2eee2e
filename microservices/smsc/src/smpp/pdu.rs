//! SMPP v3.4 PDU codec
//!
//! `decode` checks the 16 byte header before touching the body and rejects
//! out-of-range lengths before any allocation. Optional parameters are kept
//! in wire order, unknown tags included, so a relay can forward them as is.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{command, status};

pub const HEADER_LEN: usize = 16;

/// Largest PDU accepted unless configured otherwise
pub const DEFAULT_MAX_PDU_SIZE: usize = 64 * 1024;

/// `short_message` carries at most this many octets; longer content goes in
/// the `message_payload` TLV
pub const MAX_SHORT_MESSAGE: usize = 254;

/// C-octet string limits, NUL terminator included
pub mod limit {
    pub const SYSTEM_ID: usize = 16;
    pub const PASSWORD: usize = 9;
    pub const SYSTEM_TYPE: usize = 13;
    pub const ADDRESS: usize = 21;
    pub const SERVICE_TYPE: usize = 6;
    pub const TIME: usize = 17;
    pub const MESSAGE_ID: usize = 65;
    pub const ADDRESS_RANGE: usize = 41;
}

/// Optional parameter tags used by the gateway
pub mod tag {
    pub const RECEIPTED_MESSAGE_ID: u16 = 0x001E;
    pub const USER_MESSAGE_REFERENCE: u16 = 0x0204;
    pub const SC_INTERFACE_VERSION: u16 = 0x0210;
    pub const MESSAGE_PAYLOAD: u16 = 0x0424;
    pub const MESSAGE_STATE: u16 = 0x0427;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("command_length {0} out of range")]
    InvalidLength(usize),

    #[error("command_length {declared} does not match buffer length {actual}")]
    FramingMismatch { declared: usize, actual: usize },

    #[error("unknown command id {command_id:#010x}")]
    UnknownCommand {
        command_id: u32,
        sequence_number: u32,
    },

    #[error("{field} is not NUL terminated")]
    UnterminatedString { field: &'static str },

    #[error("{field} is not valid text")]
    InvalidString { field: &'static str },

    #[error("body ends inside {field}")]
    Truncated { field: &'static str },

    #[error("TLV {tag:#06x} overruns the body")]
    TruncatedTlv { tag: u16 },

    #[error("{count} octets after the end of the body")]
    TrailingOctets { count: usize },
}

impl DecodeError {
    /// Status to put in the `generic_nack` answering this PDU
    pub fn command_status(&self) -> u32 {
        match self {
            Self::InvalidLength(_)
            | Self::FramingMismatch { .. }
            | Self::TrailingOctets { .. } => status::ESME_RINVCMDLEN,
            Self::UnknownCommand { .. } => status::ESME_RINVCMDID,
            _ => status::ESME_RSYSERR,
        }
    }
}

/// Sequence number of a raw PDU, 0 when the header is incomplete
pub fn sequence_of(data: &[u8]) -> u32 {
    if data.len() < HEADER_LEN {
        return 0;
    }
    u32::from_be_bytes([data[12], data[13], data[14], data[15]])
}

/// One optional parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u16, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

/// Body of the three bind requests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bind {
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    pub interface_version: u8,
    pub addr_ton: u8,
    pub addr_npi: u8,
    pub address_range: String,
}

/// Body of the three bind responses
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindResp {
    pub system_id: String,
    pub tlvs: Vec<Tlv>,
}

/// Body shared by `submit_sm` and `deliver_sm`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmBody {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub destination_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Bytes,
    pub tlvs: Vec<Tlv>,
}

impl SmBody {
    pub fn tlv(&self, tag: u16) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tag == tag)
    }

    /// Message text: `short_message`, or `message_payload` when that is empty
    pub fn content(&self) -> &[u8] {
        if self.short_message.is_empty() {
            if let Some(payload) = self.tlv(tag::MESSAGE_PAYLOAD) {
                return &payload.value;
            }
        }
        &self.short_message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    BindReceiver(Bind),
    BindReceiverResp(BindResp),
    BindTransmitter(Bind),
    BindTransmitterResp(BindResp),
    BindTransceiver(Bind),
    BindTransceiverResp(BindResp),
    SubmitSm(SmBody),
    SubmitSmResp { message_id: String },
    DeliverSm(SmBody),
    DeliverSmResp { message_id: String },
    EnquireLink,
    EnquireLinkResp,
    Unbind,
    UnbindResp,
    GenericNack,
}

impl Body {
    pub fn command_id(&self) -> u32 {
        match self {
            Self::BindReceiver(_) => command::BIND_RECEIVER,
            Self::BindReceiverResp(_) => command::BIND_RECEIVER_RESP,
            Self::BindTransmitter(_) => command::BIND_TRANSMITTER,
            Self::BindTransmitterResp(_) => command::BIND_TRANSMITTER_RESP,
            Self::BindTransceiver(_) => command::BIND_TRANSCEIVER,
            Self::BindTransceiverResp(_) => command::BIND_TRANSCEIVER_RESP,
            Self::SubmitSm(_) => command::SUBMIT_SM,
            Self::SubmitSmResp { .. } => command::SUBMIT_SM_RESP,
            Self::DeliverSm(_) => command::DELIVER_SM,
            Self::DeliverSmResp { .. } => command::DELIVER_SM_RESP,
            Self::EnquireLink => command::ENQUIRE_LINK,
            Self::EnquireLinkResp => command::ENQUIRE_LINK_RESP,
            Self::Unbind => command::UNBIND,
            Self::UnbindResp => command::UNBIND_RESP,
            Self::GenericNack => command::GENERIC_NACK,
        }
    }

    pub fn name(&self) -> &'static str {
        command::name(self.command_id())
    }

    pub fn is_response(&self) -> bool {
        self.command_id() & command::RESPONSE_BIT != 0
    }
}

/// A complete PDU: header fields plus typed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub command_status: u32,
    pub sequence_number: u32,
    pub body: Body,
}

impl Pdu {
    pub fn new(sequence_number: u32, body: Body) -> Self {
        Self {
            command_status: status::ESME_ROK,
            sequence_number,
            body,
        }
    }

    pub fn with_status(mut self, command_status: u32) -> Self {
        self.command_status = command_status;
        self
    }

    pub fn generic_nack(sequence_number: u32, command_status: u32) -> Self {
        Self::new(sequence_number, Body::GenericNack).with_status(command_status)
    }

    /// Encode with a freshly computed command_length
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u32(self.body.command_id());
        buf.put_u32(self.command_status);
        buf.put_u32(self.sequence_number);

        match &self.body {
            Body::BindReceiver(bind) | Body::BindTransmitter(bind) | Body::BindTransceiver(bind) => {
                put_cstring(&mut buf, &bind.system_id);
                put_cstring(&mut buf, &bind.password);
                put_cstring(&mut buf, &bind.system_type);
                buf.put_u8(bind.interface_version);
                buf.put_u8(bind.addr_ton);
                buf.put_u8(bind.addr_npi);
                put_cstring(&mut buf, &bind.address_range);
            }
            Body::BindReceiverResp(resp)
            | Body::BindTransmitterResp(resp)
            | Body::BindTransceiverResp(resp) => {
                put_cstring(&mut buf, &resp.system_id);
                put_tlvs(&mut buf, &resp.tlvs);
            }
            Body::SubmitSm(sm) | Body::DeliverSm(sm) => put_sm(&mut buf, sm),
            Body::SubmitSmResp { message_id } | Body::DeliverSmResp { message_id } => {
                put_cstring(&mut buf, message_id);
            }
            Body::EnquireLink
            | Body::EnquireLinkResp
            | Body::Unbind
            | Body::UnbindResp
            | Body::GenericNack => {}
        }

        let len = buf.len() as u32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with_limit(data, DEFAULT_MAX_PDU_SIZE)
    }

    /// Decode exactly one PDU occupying all of `data`
    pub fn decode_with_limit(data: &[u8], max_size: usize) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::InvalidLength(data.len()));
        }
        let mut header = &data[..HEADER_LEN];
        let command_length = header.get_u32() as usize;
        let command_id = header.get_u32();
        let command_status = header.get_u32();
        let sequence_number = header.get_u32();

        if !(HEADER_LEN..=max_size).contains(&command_length) {
            return Err(DecodeError::InvalidLength(command_length));
        }
        if command_length != data.len() {
            return Err(DecodeError::FramingMismatch {
                declared: command_length,
                actual: data.len(),
            });
        }

        let mut body = &data[HEADER_LEN..];
        let body = match command_id {
            command::BIND_RECEIVER => Body::BindReceiver(get_bind(&mut body)?),
            command::BIND_TRANSMITTER => Body::BindTransmitter(get_bind(&mut body)?),
            command::BIND_TRANSCEIVER => Body::BindTransceiver(get_bind(&mut body)?),
            command::BIND_RECEIVER_RESP => Body::BindReceiverResp(get_bind_resp(&mut body)?),
            command::BIND_TRANSMITTER_RESP => Body::BindTransmitterResp(get_bind_resp(&mut body)?),
            command::BIND_TRANSCEIVER_RESP => Body::BindTransceiverResp(get_bind_resp(&mut body)?),
            command::SUBMIT_SM => Body::SubmitSm(get_sm(&mut body)?),
            command::DELIVER_SM => Body::DeliverSm(get_sm(&mut body)?),
            command::SUBMIT_SM_RESP => Body::SubmitSmResp {
                message_id: get_optional_cstring(&mut body, "message_id", limit::MESSAGE_ID)?,
            },
            command::DELIVER_SM_RESP => Body::DeliverSmResp {
                message_id: get_optional_cstring(&mut body, "message_id", limit::MESSAGE_ID)?,
            },
            command::ENQUIRE_LINK => Body::EnquireLink,
            command::ENQUIRE_LINK_RESP => Body::EnquireLinkResp,
            command::UNBIND => Body::Unbind,
            command::UNBIND_RESP => Body::UnbindResp,
            command::GENERIC_NACK => Body::GenericNack,
            _ => {
                return Err(DecodeError::UnknownCommand {
                    command_id,
                    sequence_number,
                })
            }
        };

        Ok(Self {
            command_status,
            sequence_number,
            body,
        })
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tlvs(buf: &mut BytesMut, tlvs: &[Tlv]) {
    for tlv in tlvs {
        buf.put_u16(tlv.tag);
        buf.put_u16(tlv.value.len() as u16);
        buf.put_slice(&tlv.value);
    }
}

fn put_sm(buf: &mut BytesMut, sm: &SmBody) {
    put_cstring(buf, &sm.service_type);
    buf.put_u8(sm.source_addr_ton);
    buf.put_u8(sm.source_addr_npi);
    put_cstring(buf, &sm.source_addr);
    buf.put_u8(sm.dest_addr_ton);
    buf.put_u8(sm.dest_addr_npi);
    put_cstring(buf, &sm.destination_addr);
    buf.put_u8(sm.esm_class);
    buf.put_u8(sm.protocol_id);
    buf.put_u8(sm.priority_flag);
    put_cstring(buf, &sm.schedule_delivery_time);
    put_cstring(buf, &sm.validity_period);
    buf.put_u8(sm.registered_delivery);
    buf.put_u8(sm.replace_if_present_flag);
    buf.put_u8(sm.data_coding);
    buf.put_u8(sm.sm_default_msg_id);
    if sm.short_message.len() <= MAX_SHORT_MESSAGE {
        buf.put_u8(sm.short_message.len() as u8);
        buf.put_slice(&sm.short_message);
        put_tlvs(buf, &sm.tlvs);
        return;
    }
    // Too long for the field: the whole text moves to `message_payload`,
    // replacing any payload already attached
    buf.put_u8(0);
    let tlvs: Vec<Tlv> = sm
        .tlvs
        .iter()
        .filter(|tlv| tlv.tag != tag::MESSAGE_PAYLOAD)
        .cloned()
        .chain(std::iter::once(Tlv::new(
            tag::MESSAGE_PAYLOAD,
            sm.short_message.clone(),
        )))
        .collect();
    put_tlvs(buf, &tlvs);
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Truncated { field });
    }
    Ok(buf.get_u8())
}

/// Read a C-octet string of at most `max` octets including the NUL
fn get_cstring(buf: &mut &[u8], field: &'static str, max: usize) -> Result<String, DecodeError> {
    let window = &buf[..buf.len().min(max)];
    let Some(end) = window.iter().position(|&b| b == 0) else {
        return Err(DecodeError::UnterminatedString { field });
    };
    let value = std::str::from_utf8(&buf[..end])
        .map_err(|_| DecodeError::InvalidString { field })?
        .to_string();
    buf.advance(end + 1);
    Ok(value)
}

/// Error responses may omit the body entirely
fn get_optional_cstring(
    buf: &mut &[u8],
    field: &'static str,
    max: usize,
) -> Result<String, DecodeError> {
    if buf.is_empty() {
        return Ok(String::new());
    }
    get_cstring(buf, field, max)
}

fn get_tlvs(buf: &mut &[u8]) -> Result<Vec<Tlv>, DecodeError> {
    let mut tlvs = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            let tag = if buf.len() >= 2 {
                u16::from_be_bytes([buf[0], buf[1]])
            } else {
                0
            };
            return Err(DecodeError::TruncatedTlv { tag });
        }
        let tag = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.len() < len {
            return Err(DecodeError::TruncatedTlv { tag });
        }
        tlvs.push(Tlv::new(tag, Bytes::copy_from_slice(&buf[..len])));
        buf.advance(len);
    }
    Ok(tlvs)
}

/// Bind bodies carry no optional parameters, so nothing may follow
/// `address_range`
fn get_bind(buf: &mut &[u8]) -> Result<Bind, DecodeError> {
    let bind = Bind {
        system_id: get_cstring(buf, "system_id", limit::SYSTEM_ID)?,
        password: get_cstring(buf, "password", limit::PASSWORD)?,
        system_type: get_cstring(buf, "system_type", limit::SYSTEM_TYPE)?,
        interface_version: get_u8(buf, "interface_version")?,
        addr_ton: get_u8(buf, "addr_ton")?,
        addr_npi: get_u8(buf, "addr_npi")?,
        address_range: get_cstring(buf, "address_range", limit::ADDRESS_RANGE)?,
    };
    if !buf.is_empty() {
        return Err(DecodeError::TrailingOctets { count: buf.len() });
    }
    Ok(bind)
}

fn get_bind_resp(buf: &mut &[u8]) -> Result<BindResp, DecodeError> {
    let system_id = get_optional_cstring(buf, "system_id", limit::SYSTEM_ID)?;
    Ok(BindResp {
        system_id,
        tlvs: get_tlvs(buf)?,
    })
}

fn get_sm(buf: &mut &[u8]) -> Result<SmBody, DecodeError> {
    let mut sm = SmBody {
        service_type: get_cstring(buf, "service_type", limit::SERVICE_TYPE)?,
        source_addr_ton: get_u8(buf, "source_addr_ton")?,
        source_addr_npi: get_u8(buf, "source_addr_npi")?,
        source_addr: get_cstring(buf, "source_addr", limit::ADDRESS)?,
        dest_addr_ton: get_u8(buf, "dest_addr_ton")?,
        dest_addr_npi: get_u8(buf, "dest_addr_npi")?,
        destination_addr: get_cstring(buf, "destination_addr", limit::ADDRESS)?,
        esm_class: get_u8(buf, "esm_class")?,
        protocol_id: get_u8(buf, "protocol_id")?,
        priority_flag: get_u8(buf, "priority_flag")?,
        schedule_delivery_time: get_cstring(buf, "schedule_delivery_time", limit::TIME)?,
        validity_period: get_cstring(buf, "validity_period", limit::TIME)?,
        registered_delivery: get_u8(buf, "registered_delivery")?,
        replace_if_present_flag: get_u8(buf, "replace_if_present_flag")?,
        data_coding: get_u8(buf, "data_coding")?,
        sm_default_msg_id: get_u8(buf, "sm_default_msg_id")?,
        ..Default::default()
    };
    let sm_length = get_u8(buf, "sm_length")? as usize;
    if buf.len() < sm_length {
        return Err(DecodeError::Truncated {
            field: "short_message",
        });
    }
    sm.short_message = Bytes::copy_from_slice(&buf[..sm_length]);
    buf.advance(sm_length);
    sm.tlvs = get_tlvs(buf)?;
    Ok(sm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit() -> SmBody {
        SmBody {
            source_addr_ton: 1,
            source_addr_npi: 1,
            source_addr: "15550001".to_string(),
            dest_addr_ton: 1,
            dest_addr_npi: 1,
            destination_addr: "15551234".to_string(),
            registered_delivery: 1,
            short_message: Bytes::from_static(b"hello"),
            tlvs: vec![
                Tlv::new(tag::USER_MESSAGE_REFERENCE, vec![0x00, 0x07]),
                Tlv::new(0x1401, vec![0xAA, 0xBB, 0xCC]),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_sm_layout() {
        let pdu = Pdu::new(7, Body::SubmitSm(submit()));
        let encoded = pdu.encode();
        assert_eq!(&encoded[0..4], &(encoded.len() as u32).to_be_bytes());
        assert_eq!(&encoded[4..8], &[0x00, 0x00, 0x00, 0x04]);
        assert_eq!(&encoded[12..16], &[0x00, 0x00, 0x00, 0x07]);
        // empty service_type, then TON/NPI and the source address
        assert_eq!(&encoded[16..20], &[0x00, 0x01, 0x01, b'1']);
        assert_eq!(Pdu::decode(&encoded).unwrap(), pdu);
    }

    #[test]
    fn test_unknown_tlv_preserved_in_order() {
        let pdu = Pdu::new(1, Body::DeliverSm(submit()));
        let Body::DeliverSm(sm) = Pdu::decode(&pdu.encode()).unwrap().body else {
            panic!("expected deliver_sm");
        };
        let tags: Vec<u16> = sm.tlvs.iter().map(|t| t.tag).collect();
        assert_eq!(tags, vec![tag::USER_MESSAGE_REFERENCE, 0x1401]);
    }

    #[test]
    fn test_length_checks() {
        let mut encoded = Pdu::new(3, Body::EnquireLink).encode().to_vec();
        encoded.push(0);
        assert_eq!(
            Pdu::decode(&encoded),
            Err(DecodeError::FramingMismatch {
                declared: 16,
                actual: 17
            })
        );

        let mut huge = vec![0u8; 16];
        huge[0..4].copy_from_slice(&(1u32 << 20).to_be_bytes());
        assert!(matches!(
            Pdu::decode(&huge),
            Err(DecodeError::InvalidLength(_))
        ));
        assert!(matches!(
            Pdu::decode(&[0u8; 8]),
            Err(DecodeError::InvalidLength(8))
        ));
    }

    #[test]
    fn test_unknown_command_keeps_sequence() {
        let mut raw = Pdu::new(42, Body::EnquireLink).encode().to_vec();
        raw[4..8].copy_from_slice(&0x0000_0103u32.to_be_bytes());
        let err = Pdu::decode(&raw).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownCommand {
                command_id: 0x103,
                sequence_number: 42
            }
        );
        assert_eq!(err.command_status(), status::ESME_RINVCMDID);
        assert_eq!(sequence_of(&raw), 42);
    }

    #[test]
    fn test_string_limits() {
        let bind = Bind {
            system_id: "a".repeat(16),
            ..Default::default()
        };
        let raw = Pdu::new(1, Body::BindTransmitter(bind)).encode();
        assert_eq!(
            Pdu::decode(&raw),
            Err(DecodeError::UnterminatedString { field: "system_id" })
        );

        let bind = Bind {
            system_id: "a".repeat(15),
            ..Default::default()
        };
        let raw = Pdu::new(1, Body::BindTransmitter(bind.clone())).encode();
        assert_eq!(
            Pdu::decode(&raw).unwrap().body,
            Body::BindTransmitter(bind)
        );
    }

    #[test]
    fn test_truncated_tlv() {
        let mut raw = Pdu::new(1, Body::SubmitSm(submit())).encode().to_vec();
        // claim a longer value for the last TLV
        let last_len = raw.len() - 5;
        raw[last_len] = 0x09;
        assert_eq!(
            Pdu::decode(&raw),
            Err(DecodeError::TruncatedTlv { tag: 0x1401 })
        );
    }

    #[test]
    fn test_error_response_without_body() {
        let mut raw = BytesMut::new();
        raw.put_u32(16);
        raw.put_u32(command::SUBMIT_SM_RESP);
        raw.put_u32(status::ESME_RTHROTTLED);
        raw.put_u32(9);
        let pdu = Pdu::decode(&raw).unwrap();
        assert_eq!(pdu.command_status, status::ESME_RTHROTTLED);
        assert_eq!(
            pdu.body,
            Body::SubmitSmResp {
                message_id: String::new()
            }
        );
    }

    #[test]
    fn test_long_short_message_moves_to_payload() {
        let mut sm = submit();
        sm.short_message = Bytes::from(vec![b'y'; 300]);
        sm.tlvs.push(Tlv::new(tag::MESSAGE_PAYLOAD, vec![b'z'; 10]));
        let Body::SubmitSm(decoded) = Pdu::decode(&Pdu::new(5, Body::SubmitSm(sm)).encode())
            .unwrap()
            .body
        else {
            panic!("expected submit_sm");
        };
        assert!(decoded.short_message.is_empty());
        assert_eq!(decoded.content(), &[b'y'; 300][..]);
        let tags: Vec<u16> = decoded.tlvs.iter().map(|t| t.tag).collect();
        assert_eq!(tags, vec![tag::USER_MESSAGE_REFERENCE, 0x1401, tag::MESSAGE_PAYLOAD]);

        // Exactly at the limit the field is used as is
        let mut sm = submit();
        sm.short_message = Bytes::from(vec![b'y'; MAX_SHORT_MESSAGE]);
        let pdu = Pdu::new(6, Body::SubmitSm(sm));
        assert_eq!(Pdu::decode(&pdu.encode()), Ok(pdu));
    }

    #[test]
    fn test_bind_with_trailing_octets_is_refused() {
        let bind = Bind {
            system_id: "esme".to_string(),
            password: "secret".to_string(),
            interface_version: 0x34,
            ..Default::default()
        };
        let mut raw = Pdu::new(2, Body::BindTransceiver(bind)).encode().to_vec();
        raw.extend_from_slice(&[0x02, 0x10, 0x00, 0x01, 0x34]);
        let len = raw.len() as u32;
        raw[0..4].copy_from_slice(&len.to_be_bytes());

        let err = Pdu::decode(&raw).unwrap_err();
        assert_eq!(err, DecodeError::TrailingOctets { count: 5 });
        assert_eq!(err.command_status(), status::ESME_RINVCMDLEN);
    }

    #[test]
    fn test_payload_content() {
        let mut sm = submit();
        sm.short_message = Bytes::new();
        sm.tlvs.push(Tlv::new(tag::MESSAGE_PAYLOAD, vec![b'x'; 300]));
        assert_eq!(sm.content().len(), 300);
    }
}
