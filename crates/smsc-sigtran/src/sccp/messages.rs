//! SCCP Message Types
//!
//! Variable-length mandatory parameters are reached through one-octet
//! pointers, each relative to the position of the pointer itself. The
//! optional part is a sequence of (name, length, value) terminated by a
//! zero name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::address::SccpAddress;
use super::MessageType;
use crate::errors::SccpError;
use crate::types::ProtocolClass;

mod param {
    pub const END_OF_OPTIONAL: u8 = 0x00;
    pub const CALLED_PARTY: u8 = 0x03;
    pub const CALLING_PARTY: u8 = 0x04;
    pub const CREDIT: u8 = 0x09;
    pub const DATA: u8 = 0x0F;
    pub const IMPORTANCE: u8 = 0x12;
}

/// SCCP Message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SccpMessage {
    /// Unitdata (connectionless)
    Udt {
        protocol_class: ProtocolClass,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
    },
    /// Unitdata Service (returned UDT)
    Udts {
        return_cause: u8,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
    },
    /// Extended Unitdata
    Xudt {
        protocol_class: ProtocolClass,
        hop_counter: u8,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
        importance: Option<u8>,
    },
    /// Connection Request
    Cr {
        source_local_reference: u32,
        protocol_class: ProtocolClass,
        called_party: SccpAddress,
        credit: Option<u8>,
        calling_party: Option<SccpAddress>,
        data: Option<Bytes>,
    },
    /// Connection Confirm
    Cc {
        destination_local_reference: u32,
        source_local_reference: u32,
        protocol_class: ProtocolClass,
        credit: Option<u8>,
        called_party: Option<SccpAddress>,
        data: Option<Bytes>,
    },
    /// Connection Refused
    Cref {
        destination_local_reference: u32,
        refusal_cause: u8,
    },
    /// Released
    Rlsd {
        destination_local_reference: u32,
        source_local_reference: u32,
        release_cause: u8,
        data: Option<Bytes>,
    },
    /// Release Complete
    Rlc {
        destination_local_reference: u32,
        source_local_reference: u32,
    },
    /// Data Form 1
    Dt1 {
        destination_local_reference: u32,
        segmenting: bool,
        data: Bytes,
    },
}

fn put_reference(buf: &mut BytesMut, reference: u32) {
    buf.put_u8(reference as u8);
    buf.put_u8((reference >> 8) as u8);
    buf.put_u8((reference >> 16) as u8);
}

fn get_reference(buf: &mut Bytes) -> u32 {
    let b0 = buf.get_u8() as u32;
    let b1 = buf.get_u8() as u32;
    let b2 = buf.get_u8() as u32;
    b0 | (b1 << 8) | (b2 << 16)
}

fn too_long(what: &str, len: usize) -> SccpError {
    SccpError::InvalidMessage(format!("{} of {} octets does not fit", what, len))
}

/// Append pointers then the mandatory variable parameters, then the
/// optional part when `optional` is `Some`
fn put_variable(
    buf: &mut BytesMut,
    mandatory: &[&[u8]],
    optional: Option<Vec<(u8, Bytes)>>,
) -> Result<(), SccpError> {
    let pointer_count = mandatory.len() + usize::from(optional.is_some());
    let mut body = BytesMut::new();
    let mut pointers = Vec::with_capacity(pointer_count);

    for (i, value) in mandatory.iter().enumerate() {
        if value.len() > 255 {
            return Err(too_long("parameter", value.len()));
        }
        pointers.push(pointer_count - i + body.len());
        body.put_u8(value.len() as u8);
        body.put_slice(value);
    }

    if let Some(params) = optional {
        let present: Vec<_> = params.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        if present.is_empty() {
            pointers.push(0);
        } else {
            pointers.push(pointer_count - mandatory.len() + body.len());
            for (name, value) in present {
                if value.len() > 255 {
                    return Err(too_long("optional parameter", value.len()));
                }
                body.put_u8(name);
                body.put_u8(value.len() as u8);
                body.put_slice(&value);
            }
            body.put_u8(param::END_OF_OPTIONAL);
        }
    }

    for pointer in pointers {
        if pointer > 255 {
            return Err(too_long("message", pointer));
        }
        buf.put_u8(pointer as u8);
    }
    buf.put_slice(&body);
    Ok(())
}

/// Parsed variable and optional parts
struct Variable {
    mandatory: Vec<Bytes>,
    optional: Vec<(u8, Bytes)>,
}

impl Variable {
    fn optional(&self, name: u8) -> Option<&Bytes> {
        self.optional.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

/// `rest` starts at the first pointer
fn get_variable(rest: &Bytes, mandatory: usize, has_optional: bool) -> Result<Variable, SccpError> {
    let pointer_count = mandatory + usize::from(has_optional);
    if rest.len() < pointer_count {
        return Err(SccpError::InvalidMessage("missing pointers".to_string()));
    }

    let locate = |i: usize| -> Result<Option<usize>, SccpError> {
        let pointer = rest[i] as usize;
        if pointer == 0 {
            return Ok(None);
        }
        let at = i + pointer;
        if at >= rest.len() {
            return Err(SccpError::InvalidMessage(format!("pointer {} out of range", i)));
        }
        Ok(Some(at))
    };

    let mut values = Vec::with_capacity(mandatory);
    for i in 0..mandatory {
        let at = locate(i)?
            .ok_or_else(|| SccpError::InvalidMessage("zero mandatory pointer".to_string()))?;
        let len = rest[at] as usize;
        if at + 1 + len > rest.len() {
            return Err(SccpError::InvalidMessage(format!(
                "parameter {} overruns message",
                i
            )));
        }
        values.push(rest.slice(at + 1..at + 1 + len));
    }

    let mut optional = Vec::new();
    if has_optional {
        if let Some(mut at) = locate(mandatory)? {
            loop {
                let name = *rest
                    .get(at)
                    .ok_or_else(|| SccpError::InvalidMessage("unterminated optional part".to_string()))?;
                if name == param::END_OF_OPTIONAL {
                    break;
                }
                let len = *rest
                    .get(at + 1)
                    .ok_or_else(|| SccpError::InvalidMessage("truncated optional parameter".to_string()))?
                    as usize;
                if at + 2 + len > rest.len() {
                    return Err(SccpError::InvalidMessage(format!(
                        "optional parameter 0x{:02X} overruns message",
                        name
                    )));
                }
                optional.push((name, rest.slice(at + 2..at + 2 + len)));
                at += 2 + len;
            }
        }
    }

    Ok(Variable {
        mandatory: values,
        optional,
    })
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<(), SccpError> {
    if buf.remaining() < len {
        return Err(SccpError::InvalidMessage(format!("{} too short", what)));
    }
    Ok(())
}

fn opt_address(value: Option<&Bytes>) -> Result<Option<SccpAddress>, SccpError> {
    value.map(|v| SccpAddress::decode(v.clone())).transpose()
}

fn opt_encoded(address: &Option<SccpAddress>) -> Result<Bytes, SccpError> {
    Ok(match address {
        Some(a) => a.encode()?,
        None => Bytes::new(),
    })
}

fn opt_byte(value: Option<u8>) -> Bytes {
    value.map(|v| Bytes::copy_from_slice(&[v])).unwrap_or_default()
}

impl SccpMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Udt { .. } => MessageType::Udt,
            Self::Udts { .. } => MessageType::Udts,
            Self::Xudt { .. } => MessageType::Xudt,
            Self::Cr { .. } => MessageType::Cr,
            Self::Cc { .. } => MessageType::Cc,
            Self::Cref { .. } => MessageType::Cref,
            Self::Rlsd { .. } => MessageType::Rlsd,
            Self::Rlc { .. } => MessageType::Rlc,
            Self::Dt1 { .. } => MessageType::Dt1,
        }
    }

    pub fn encode(&self) -> Result<Bytes, SccpError> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(self.message_type() as u8);

        match self {
            Self::Udt {
                protocol_class,
                called_party,
                calling_party,
                data,
            } => {
                buf.put_u8(protocol_class.encode());
                put_variable(
                    &mut buf,
                    &[&called_party.encode()?, &calling_party.encode()?, data],
                    None,
                )?;
            }
            Self::Udts {
                return_cause,
                called_party,
                calling_party,
                data,
            } => {
                buf.put_u8(*return_cause);
                put_variable(
                    &mut buf,
                    &[&called_party.encode()?, &calling_party.encode()?, data],
                    None,
                )?;
            }
            Self::Xudt {
                protocol_class,
                hop_counter,
                called_party,
                calling_party,
                data,
                importance,
            } => {
                buf.put_u8(protocol_class.encode());
                buf.put_u8(*hop_counter);
                put_variable(
                    &mut buf,
                    &[&called_party.encode()?, &calling_party.encode()?, data],
                    Some(vec![(param::IMPORTANCE, opt_byte(*importance))]),
                )?;
            }
            Self::Cr {
                source_local_reference,
                protocol_class,
                called_party,
                credit,
                calling_party,
                data,
            } => {
                put_reference(&mut buf, *source_local_reference);
                buf.put_u8(protocol_class.encode());
                put_variable(
                    &mut buf,
                    &[&called_party.encode()?],
                    Some(vec![
                        (param::CREDIT, opt_byte(*credit)),
                        (param::CALLING_PARTY, opt_encoded(calling_party)?),
                        (param::DATA, data.clone().unwrap_or_default()),
                    ]),
                )?;
            }
            Self::Cc {
                destination_local_reference,
                source_local_reference,
                protocol_class,
                credit,
                called_party,
                data,
            } => {
                put_reference(&mut buf, *destination_local_reference);
                put_reference(&mut buf, *source_local_reference);
                buf.put_u8(protocol_class.encode());
                put_variable(
                    &mut buf,
                    &[],
                    Some(vec![
                        (param::CREDIT, opt_byte(*credit)),
                        (param::CALLED_PARTY, opt_encoded(called_party)?),
                        (param::DATA, data.clone().unwrap_or_default()),
                    ]),
                )?;
            }
            Self::Cref {
                destination_local_reference,
                refusal_cause,
            } => {
                put_reference(&mut buf, *destination_local_reference);
                buf.put_u8(*refusal_cause);
                put_variable(&mut buf, &[], Some(Vec::new()))?;
            }
            Self::Rlsd {
                destination_local_reference,
                source_local_reference,
                release_cause,
                data,
            } => {
                put_reference(&mut buf, *destination_local_reference);
                put_reference(&mut buf, *source_local_reference);
                buf.put_u8(*release_cause);
                put_variable(
                    &mut buf,
                    &[],
                    Some(vec![(param::DATA, data.clone().unwrap_or_default())]),
                )?;
            }
            Self::Rlc {
                destination_local_reference,
                source_local_reference,
            } => {
                put_reference(&mut buf, *destination_local_reference);
                put_reference(&mut buf, *source_local_reference);
            }
            Self::Dt1 {
                destination_local_reference,
                segmenting,
                data,
            } => {
                put_reference(&mut buf, *destination_local_reference);
                buf.put_u8(u8::from(*segmenting));
                put_variable(&mut buf, &[data], None)?;
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(data: &Bytes) -> Result<Self, SccpError> {
        if data.is_empty() {
            return Err(SccpError::InvalidMessage("Empty message".to_string()));
        }

        let mut buf = data.clone();
        let msg_type = buf.get_u8();

        let message = match msg_type {
            t if t == MessageType::Udt as u8 || t == MessageType::Udts as u8 => {
                need(&buf, 1, "UDT")?;
                let first = buf.get_u8();
                let mut var = get_variable(&buf, 3, false)?;
                let data = var.mandatory.pop().unwrap_or_default();
                let calling_party = SccpAddress::decode(var.mandatory.pop().unwrap_or_default())?;
                let called_party = SccpAddress::decode(var.mandatory.pop().unwrap_or_default())?;
                if t == MessageType::Udt as u8 {
                    Self::Udt {
                        protocol_class: ProtocolClass::decode(first),
                        called_party,
                        calling_party,
                        data,
                    }
                } else {
                    Self::Udts {
                        return_cause: first,
                        called_party,
                        calling_party,
                        data,
                    }
                }
            }
            t if t == MessageType::Xudt as u8 => {
                need(&buf, 2, "XUDT")?;
                let protocol_class = ProtocolClass::decode(buf.get_u8());
                let hop_counter = buf.get_u8();
                let mut var = get_variable(&buf, 3, true)?;
                let importance = var.optional(param::IMPORTANCE).and_then(|v| v.first().copied());
                let data = var.mandatory.pop().unwrap_or_default();
                let calling_party = SccpAddress::decode(var.mandatory.pop().unwrap_or_default())?;
                let called_party = SccpAddress::decode(var.mandatory.pop().unwrap_or_default())?;
                Self::Xudt {
                    protocol_class,
                    hop_counter,
                    called_party,
                    calling_party,
                    data,
                    importance,
                }
            }
            t if t == MessageType::Cr as u8 => {
                need(&buf, 4, "CR")?;
                let source_local_reference = get_reference(&mut buf);
                let protocol_class = ProtocolClass::decode(buf.get_u8());
                let mut var = get_variable(&buf, 1, true)?;
                let credit = var.optional(param::CREDIT).and_then(|v| v.first().copied());
                let calling_party = opt_address(var.optional(param::CALLING_PARTY))?;
                let data = var.optional(param::DATA).cloned();
                Self::Cr {
                    source_local_reference,
                    protocol_class,
                    called_party: SccpAddress::decode(var.mandatory.pop().unwrap_or_default())?,
                    credit,
                    calling_party,
                    data,
                }
            }
            t if t == MessageType::Cc as u8 => {
                need(&buf, 7, "CC")?;
                let destination_local_reference = get_reference(&mut buf);
                let source_local_reference = get_reference(&mut buf);
                let protocol_class = ProtocolClass::decode(buf.get_u8());
                let var = get_variable(&buf, 0, true)?;
                Self::Cc {
                    destination_local_reference,
                    source_local_reference,
                    protocol_class,
                    credit: var.optional(param::CREDIT).and_then(|v| v.first().copied()),
                    called_party: opt_address(var.optional(param::CALLED_PARTY))?,
                    data: var.optional(param::DATA).cloned(),
                }
            }
            t if t == MessageType::Cref as u8 => {
                need(&buf, 4, "CREF")?;
                Self::Cref {
                    destination_local_reference: get_reference(&mut buf),
                    refusal_cause: buf.get_u8(),
                }
            }
            t if t == MessageType::Rlsd as u8 => {
                need(&buf, 7, "RLSD")?;
                let destination_local_reference = get_reference(&mut buf);
                let source_local_reference = get_reference(&mut buf);
                let release_cause = buf.get_u8();
                let var = get_variable(&buf, 0, true)?;
                Self::Rlsd {
                    destination_local_reference,
                    source_local_reference,
                    release_cause,
                    data: var.optional(param::DATA).cloned(),
                }
            }
            t if t == MessageType::Rlc as u8 => {
                need(&buf, 6, "RLC")?;
                Self::Rlc {
                    destination_local_reference: get_reference(&mut buf),
                    source_local_reference: get_reference(&mut buf),
                }
            }
            t if t == MessageType::Dt1 as u8 => {
                need(&buf, 4, "DT1")?;
                let destination_local_reference = get_reference(&mut buf);
                let segmenting = buf.get_u8() & 0x01 != 0;
                let mut var = get_variable(&buf, 1, false)?;
                Self::Dt1 {
                    destination_local_reference,
                    segmenting,
                    data: var.mandatory.pop().unwrap_or_default(),
                }
            }
            _ => {
                return Err(SccpError::InvalidMessage(format!(
                    "Unknown message type: 0x{:02X}",
                    msg_type
                )))
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::GlobalTitle;

    fn called() -> SccpAddress {
        SccpAddress::from_gt(GlobalTitle::e164("447700900001", 0), Some(8))
    }

    fn calling() -> SccpAddress {
        SccpAddress::from_gt(GlobalTitle::e164("447700900999", 0), Some(8))
    }

    fn roundtrip(message: SccpMessage) {
        let encoded = message.encode().unwrap();
        assert_eq!(SccpMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_udt_pointers() {
        let message = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_1.with_return_on_error(),
            called_party: SccpAddress::from_ssn_pc(8, 1001),
            calling_party: SccpAddress::from_ssn_pc(8, 2002),
            data: Bytes::from_static(b"\x62\x00"),
        };
        let encoded = message.encode().unwrap();
        // type, class, then pointers relative to their own position
        assert_eq!(&encoded[..5], &[0x09, 0x81, 3, 7, 11]);
        roundtrip(message);
    }

    #[test]
    fn test_connectionless_roundtrips() {
        roundtrip(SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(&[0xAA; 40]),
        });
        roundtrip(SccpMessage::Udts {
            return_cause: 1,
            called_party: calling(),
            calling_party: called(),
            data: Bytes::from_static(b"tcap"),
        });
        roundtrip(SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_1,
            hop_counter: 15,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"tcap"),
            importance: Some(3),
        });
        roundtrip(SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_0,
            hop_counter: 10,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"tcap"),
            importance: None,
        });
    }

    #[test]
    fn test_connection_oriented_roundtrips() {
        roundtrip(SccpMessage::Cr {
            source_local_reference: 0x0A0B0C,
            protocol_class: ProtocolClass::CLASS_2,
            called_party: called(),
            credit: None,
            calling_party: Some(calling()),
            data: Some(Bytes::from_static(b"hello")),
        });
        roundtrip(SccpMessage::Cc {
            destination_local_reference: 0x0A0B0C,
            source_local_reference: 7,
            protocol_class: ProtocolClass::CLASS_2,
            credit: None,
            called_party: None,
            data: None,
        });
        roundtrip(SccpMessage::Cref {
            destination_local_reference: 3,
            refusal_cause: 0x0E,
        });
        roundtrip(SccpMessage::Rlsd {
            destination_local_reference: 7,
            source_local_reference: 0x0A0B0C,
            release_cause: 0,
            data: None,
        });
        roundtrip(SccpMessage::Rlc {
            destination_local_reference: 0x0A0B0C,
            source_local_reference: 7,
        });
        roundtrip(SccpMessage::Dt1 {
            destination_local_reference: 7,
            segmenting: false,
            data: Bytes::from_static(b"payload"),
        });
    }

    #[test]
    fn test_pointer_out_of_range() {
        let raw = Bytes::from_static(&[0x09, 0x00, 0x03, 0x40, 0x50, 0x01]);
        assert!(SccpMessage::decode(&raw).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let raw = Bytes::from_static(&[0x7E, 0x00]);
        assert!(matches!(
            SccpMessage::decode(&raw),
            Err(SccpError::InvalidMessage(_))
        ));
    }
}
