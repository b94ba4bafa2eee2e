//! M3UA Message Encoding/Decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::messages::{M3uaMessage, ProtocolData};
use super::ParameterTag;
use crate::errors::M3uaError;
use crate::types::TrafficModeType;

/// M3UA Version
const M3UA_VERSION: u8 = 1;

const HEADER_LEN: usize = 8;

/// A parameter kept as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub tag: u16,
    pub value: Bytes,
}

/// A decoded message plus the parameters this codec does not interpret,
/// kept in wire order so they can be forwarded unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3uaPdu {
    pub message: M3uaMessage,
    pub unknown: Vec<Parameter>,
}

impl From<M3uaMessage> for M3uaPdu {
    fn from(message: M3uaMessage) -> Self {
        Self {
            message,
            unknown: Vec::new(),
        }
    }
}

fn put_param(buf: &mut BytesMut, tag: u16, value: &[u8]) {
    buf.put_u16(tag);
    buf.put_u16(4 + value.len() as u16);
    buf.put_slice(value);

    // Pad to 4-byte boundary
    for _ in 0..(4 - value.len() % 4) % 4 {
        buf.put_u8(0);
    }
}

fn put_u32s(buf: &mut BytesMut, tag: ParameterTag, values: &[u32]) {
    if values.is_empty() {
        return;
    }
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    put_param(buf, tag as u16, &bytes);
}

fn put_opt_u32(buf: &mut BytesMut, tag: ParameterTag, value: Option<u32>) {
    if let Some(v) = value {
        put_param(buf, tag as u16, &v.to_be_bytes());
    }
}

fn put_info(buf: &mut BytesMut, info: &Option<String>) {
    if let Some(info) = info {
        put_param(buf, ParameterTag::InfoString as u16, info.as_bytes());
    }
}

/// Encode an M3UA message with its preserved parameters
pub fn encode(pdu: &M3uaPdu) -> Bytes {
    let mut params = BytesMut::new();

    match &pdu.message {
        M3uaMessage::AspUp {
            asp_identifier,
            info_string,
        } => {
            put_opt_u32(&mut params, ParameterTag::AspIdentifier, *asp_identifier);
            put_info(&mut params, info_string);
        }
        M3uaMessage::AspUpAck { info_string }
        | M3uaMessage::AspDown { info_string }
        | M3uaMessage::AspDownAck { info_string } => put_info(&mut params, info_string),
        M3uaMessage::AspActive {
            traffic_mode_type,
            routing_context,
            info_string,
        }
        | M3uaMessage::AspActiveAck {
            traffic_mode_type,
            routing_context,
            info_string,
        } => {
            put_opt_u32(
                &mut params,
                ParameterTag::TrafficModeType,
                traffic_mode_type.map(|m| m as u32),
            );
            put_u32s(&mut params, ParameterTag::RoutingContext, routing_context);
            put_info(&mut params, info_string);
        }
        M3uaMessage::AspInactive {
            routing_context,
            info_string,
        }
        | M3uaMessage::AspInactiveAck {
            routing_context,
            info_string,
        } => {
            put_u32s(&mut params, ParameterTag::RoutingContext, routing_context);
            put_info(&mut params, info_string);
        }
        M3uaMessage::Heartbeat { data } | M3uaMessage::HeartbeatAck { data } => {
            put_param(&mut params, ParameterTag::HeartbeatData as u16, data);
        }
        M3uaMessage::Data {
            network_appearance,
            routing_context,
            protocol_data,
            correlation_id,
        } => {
            put_opt_u32(&mut params, ParameterTag::NetworkAppearance, *network_appearance);
            put_opt_u32(&mut params, ParameterTag::RoutingContext, *routing_context);
            put_param(
                &mut params,
                ParameterTag::ProtocolData as u16,
                &protocol_data.encode(),
            );
            put_opt_u32(&mut params, ParameterTag::CorrelationId, *correlation_id);
        }
        M3uaMessage::Error {
            error_code,
            routing_context,
            diagnostic_info,
        } => {
            put_param(
                &mut params,
                ParameterTag::ErrorCode as u16,
                &error_code.to_be_bytes(),
            );
            put_u32s(&mut params, ParameterTag::RoutingContext, routing_context);
            if let Some(diag) = diagnostic_info {
                put_param(&mut params, ParameterTag::DiagnosticInfo as u16, diag);
            }
        }
        M3uaMessage::Notify {
            status_type,
            status_info,
            routing_context,
            info_string,
        } => {
            let mut status = [0u8; 4];
            status[..2].copy_from_slice(&status_type.to_be_bytes());
            status[2..].copy_from_slice(&status_info.to_be_bytes());
            put_param(&mut params, ParameterTag::Status as u16, &status);
            put_u32s(&mut params, ParameterTag::RoutingContext, routing_context);
            put_info(&mut params, info_string);
        }
        M3uaMessage::Duna {
            network_appearance,
            routing_context,
            affected_point_code,
            info_string,
        }
        | M3uaMessage::Dava {
            network_appearance,
            routing_context,
            affected_point_code,
            info_string,
        } => {
            put_opt_u32(&mut params, ParameterTag::NetworkAppearance, *network_appearance);
            put_u32s(&mut params, ParameterTag::RoutingContext, routing_context);
            put_u32s(
                &mut params,
                ParameterTag::AffectedPointCode,
                affected_point_code,
            );
            put_info(&mut params, info_string);
        }
    }

    for param in &pdu.unknown {
        put_param(&mut params, param.tag, &param.value);
    }

    let length = HEADER_LEN + params.len();
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u8(M3UA_VERSION);
    buf.put_u8(0); // Reserved
    buf.put_u8(pdu.message.class());
    buf.put_u8(pdu.message.message_type());
    buf.put_u32(length as u32);
    buf.put_slice(&params);
    buf.freeze()
}

/// Encode a message that carries no preserved parameters
pub fn encode_message(message: M3uaMessage) -> Bytes {
    encode(&M3uaPdu::from(message))
}

struct Params(Vec<Parameter>);

impl Params {
    fn get(&self, tag: ParameterTag) -> Option<&Bytes> {
        self.0.iter().find(|p| p.tag == tag as u16).map(|p| &p.value)
    }

    fn u32(&self, tag: ParameterTag) -> Option<u32> {
        self.get(tag)
            .filter(|v| v.len() >= 4)
            .map(|v| (&v[..4]).get_u32())
    }

    fn u32s(&self, tag: ParameterTag) -> Vec<u32> {
        self.get(tag)
            .map(|v| v.chunks_exact(4).map(|mut c| c.get_u32()).collect())
            .unwrap_or_default()
    }

    fn string(&self, tag: ParameterTag) -> Option<String> {
        self.get(tag)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    fn required(&self, tag: ParameterTag) -> Result<&Bytes, M3uaError> {
        self.get(tag)
            .ok_or_else(|| M3uaError::InvalidMessage(format!("missing parameter {:?}", tag)))
    }

    fn unknown(self) -> Vec<Parameter> {
        self.0
            .into_iter()
            .filter(|p| ParameterTag::from_u16(p.tag).is_none())
            .collect()
    }
}

fn parse_parameters(mut cursor: Bytes) -> Result<Params, M3uaError> {
    let mut params = Vec::new();

    while cursor.remaining() >= 4 {
        let tag = cursor.get_u16();
        let length = cursor.get_u16() as usize;

        if length < 4 || cursor.remaining() < length - 4 {
            return Err(M3uaError::InvalidMessage(format!(
                "parameter 0x{:04X} overruns message",
                tag
            )));
        }

        let value_len = length - 4;
        let value = cursor.split_to(value_len);
        params.push(Parameter { tag, value });

        let padding = ((4 - value_len % 4) % 4).min(cursor.remaining());
        cursor.advance(padding);
    }

    Ok(Params(params))
}

/// Decode one M3UA message
pub fn decode(data: &[u8]) -> Result<M3uaPdu, M3uaError> {
    if data.len() < HEADER_LEN {
        return Err(M3uaError::InvalidMessage("Message too short".to_string()));
    }

    let mut buf = Bytes::copy_from_slice(data);

    let version = buf.get_u8();
    if version != M3UA_VERSION {
        return Err(M3uaError::InvalidMessage(format!(
            "Invalid version: {}",
            version
        )));
    }

    let _reserved = buf.get_u8();
    let msg_class = buf.get_u8();
    let msg_type = buf.get_u8();
    let length = buf.get_u32() as usize;

    if length < HEADER_LEN || data.len() < length {
        return Err(M3uaError::InvalidMessage(format!(
            "length {} for {} bytes",
            length,
            data.len()
        )));
    }

    let params = parse_parameters(buf.split_to(length - HEADER_LEN))?;
    let info_string = params.string(ParameterTag::InfoString);

    let message = match (msg_class, msg_type) {
        (3, 1) => M3uaMessage::AspUp {
            asp_identifier: params.u32(ParameterTag::AspIdentifier),
            info_string,
        },
        (3, 2) => M3uaMessage::AspDown { info_string },
        (3, 3) => M3uaMessage::Heartbeat {
            data: params.get(ParameterTag::HeartbeatData).cloned().unwrap_or_default(),
        },
        (3, 4) => M3uaMessage::AspUpAck { info_string },
        (3, 5) => M3uaMessage::AspDownAck { info_string },
        (3, 6) => M3uaMessage::HeartbeatAck {
            data: params.get(ParameterTag::HeartbeatData).cloned().unwrap_or_default(),
        },
        (4, 1) | (4, 3) => {
            let traffic_mode_type = params
                .u32(ParameterTag::TrafficModeType)
                .and_then(TrafficModeType::from_u32);
            let routing_context = params.u32s(ParameterTag::RoutingContext);
            if msg_type == 1 {
                M3uaMessage::AspActive {
                    traffic_mode_type,
                    routing_context,
                    info_string,
                }
            } else {
                M3uaMessage::AspActiveAck {
                    traffic_mode_type,
                    routing_context,
                    info_string,
                }
            }
        }
        (4, 2) => M3uaMessage::AspInactive {
            routing_context: params.u32s(ParameterTag::RoutingContext),
            info_string,
        },
        (4, 4) => M3uaMessage::AspInactiveAck {
            routing_context: params.u32s(ParameterTag::RoutingContext),
            info_string,
        },
        (1, 1) => {
            let pd_bytes = params.required(ParameterTag::ProtocolData)?;
            M3uaMessage::Data {
                network_appearance: params.u32(ParameterTag::NetworkAppearance),
                routing_context: params.u32(ParameterTag::RoutingContext),
                protocol_data: ProtocolData::decode(pd_bytes.clone())?,
                correlation_id: params.u32(ParameterTag::CorrelationId),
            }
        }
        (0, 0) => M3uaMessage::Error {
            error_code: params
                .u32(ParameterTag::ErrorCode)
                .ok_or_else(|| M3uaError::InvalidMessage("ERR without error code".to_string()))?,
            routing_context: params.u32s(ParameterTag::RoutingContext),
            diagnostic_info: params.get(ParameterTag::DiagnosticInfo).cloned(),
        },
        (0, 1) => {
            let status = params.required(ParameterTag::Status)?;
            if status.len() < 4 {
                return Err(M3uaError::InvalidMessage("short status".to_string()));
            }
            let mut status = &status[..4];
            M3uaMessage::Notify {
                status_type: status.get_u16(),
                status_info: status.get_u16(),
                routing_context: params.u32s(ParameterTag::RoutingContext),
                info_string,
            }
        }
        (2, 1) | (2, 2) => {
            let network_appearance = params.u32(ParameterTag::NetworkAppearance);
            let routing_context = params.u32s(ParameterTag::RoutingContext);
            let affected_point_code = params.u32s(ParameterTag::AffectedPointCode);
            if msg_type == 1 {
                M3uaMessage::Duna {
                    network_appearance,
                    routing_context,
                    affected_point_code,
                    info_string,
                }
            } else {
                M3uaMessage::Dava {
                    network_appearance,
                    routing_context,
                    affected_point_code,
                    info_string,
                }
            }
        }
        _ => {
            return Err(M3uaError::Unsupported {
                class: msg_class,
                msg_type,
            })
        }
    };

    Ok(M3uaPdu {
        message,
        unknown: params.unknown(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_message() -> M3uaMessage {
        M3uaMessage::Data {
            network_appearance: None,
            routing_context: Some(100),
            protocol_data: ProtocolData::sccp(1001, 2001, 2, 5, Bytes::from_static(b"\x09\x81\x03")),
            correlation_id: None,
        }
    }

    #[test]
    fn test_data_roundtrip() {
        let pdu = M3uaPdu::from(data_message());
        let decoded = decode(&encode(&pdu)).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode_message(M3uaMessage::AspUp {
            asp_identifier: None,
            info_string: None,
        });
        assert_eq!(&encoded[..], &[1, 0, 3, 1, 0, 0, 0, 8]);
    }

    #[test]
    fn test_unknown_parameters_preserved_in_order() {
        let pdu = M3uaPdu {
            message: M3uaMessage::AspActive {
                traffic_mode_type: Some(TrafficModeType::Loadshare),
                routing_context: vec![7, 8],
                info_string: Some("asp".to_string()),
            },
            unknown: vec![
                Parameter {
                    tag: 0x8001,
                    value: Bytes::from_static(b"abc"),
                },
                Parameter {
                    tag: 0x7F00,
                    value: Bytes::from_static(b"12345678"),
                },
            ],
        };
        let decoded = decode(&encode(&pdu)).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_heartbeat_and_notify() {
        for message in [
            M3uaMessage::Heartbeat {
                data: Bytes::from_static(&[1, 2, 3, 4, 5]),
            },
            M3uaMessage::Notify {
                status_type: 1,
                status_info: 3,
                routing_context: vec![],
                info_string: None,
            },
            M3uaMessage::Error {
                error_code: crate::m3ua::error_code::UNEXPECTED_MESSAGE,
                routing_context: vec![],
                diagnostic_info: None,
            },
        ] {
            let pdu = M3uaPdu::from(message);
            assert_eq!(decode(&encode(&pdu)).unwrap(), pdu);
        }
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut raw = encode_message(data_message()).to_vec();
        raw[0] = 2;
        assert!(matches!(decode(&raw), Err(M3uaError::InvalidMessage(_))));
    }

    #[test]
    fn test_rejects_truncated_parameter() {
        let mut raw = encode_message(data_message()).to_vec();
        raw.truncate(raw.len() - 4);
        let len = raw.len() as u32;
        raw[4..8].copy_from_slice(&len.to_be_bytes());
        assert!(decode(&raw).is_err());
    }

    #[test]
    fn test_unsupported_class() {
        let raw = [1, 0, 9, 1, 0, 0, 0, 8];
        assert!(matches!(
            decode(&raw),
            Err(M3uaError::Unsupported { class: 9, msg_type: 1 })
        ));
    }
}
