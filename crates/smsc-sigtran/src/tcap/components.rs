//! TCAP Components

use bytes::{BufMut, Bytes, BytesMut};

use super::asn1::{self, tag};
use crate::errors::TcapError;

/// TCAP Component Tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComponentTag {
    Invoke = 0xA1,
    ReturnResultLast = 0xA2,
    ReturnError = 0xA3,
    Reject = 0xA4,
    ReturnResultNotLast = 0xA7,
}

const LINKED_ID: u8 = 0x80;
const REJECT_INVOKE_ID_NULL: u8 = tag::NULL;

/// Reject problem, tagged by problem family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    General(u8),
    Invoke(u8),
    ReturnResult(u8),
    ReturnError(u8),
}

impl Problem {
    /// mistypedComponent
    pub const MISTYPED_COMPONENT: Self = Self::General(1);
    /// unrecognizedOperation
    pub const UNRECOGNIZED_OPERATION: Self = Self::Invoke(1);
    /// mistypedParameter
    pub const MISTYPED_PARAMETER: Self = Self::Invoke(2);

    fn tag(&self) -> u8 {
        match self {
            Self::General(_) => 0x80,
            Self::Invoke(_) => 0x81,
            Self::ReturnResult(_) => 0x82,
            Self::ReturnError(_) => 0x83,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::General(c) | Self::Invoke(c) | Self::ReturnResult(c) | Self::ReturnError(c) => *c,
        }
    }

    fn from_tlv(tlv: asn1::Tlv<'_>) -> Result<Self, TcapError> {
        let code = tlv.integer()? as u8;
        match tlv.tag {
            0x80 => Ok(Self::General(code)),
            0x81 => Ok(Self::Invoke(code)),
            0x82 => Ok(Self::ReturnResult(code)),
            0x83 => Ok(Self::ReturnError(code)),
            other => Err(TcapError::UnexpectedTag(other)),
        }
    }
}

/// TCAP Component
///
/// Parameters are kept as the complete encoded TLV so MAP can decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Invoke {
        invoke_id: i32,
        linked_id: Option<i32>,
        operation_code: i32,
        parameter: Option<Bytes>,
    },
    ReturnResultLast {
        invoke_id: i32,
        operation_code: Option<i32>,
        parameter: Option<Bytes>,
    },
    ReturnResultNotLast {
        invoke_id: i32,
        operation_code: Option<i32>,
        parameter: Option<Bytes>,
    },
    ReturnError {
        invoke_id: i32,
        error_code: i32,
        parameter: Option<Bytes>,
    },
    Reject {
        invoke_id: Option<i32>,
        problem: Problem,
    },
}

impl Component {
    pub fn invoke_id(&self) -> Option<i32> {
        match self {
            Self::Invoke { invoke_id, .. }
            | Self::ReturnResultLast { invoke_id, .. }
            | Self::ReturnResultNotLast { invoke_id, .. }
            | Self::ReturnError { invoke_id, .. } => Some(*invoke_id),
            Self::Reject { invoke_id, .. } => *invoke_id,
        }
    }

    /// Encode component to ASN.1
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut content = BytesMut::new();

        let component_tag = match self {
            Self::Invoke {
                invoke_id,
                linked_id,
                operation_code,
                parameter,
            } => {
                asn1::encode_integer(&mut content, tag::INTEGER, *invoke_id);
                if let Some(lid) = linked_id {
                    asn1::encode_integer(&mut content, LINKED_ID, *lid);
                }
                asn1::encode_integer(&mut content, tag::INTEGER, *operation_code);
                if let Some(param) = parameter {
                    content.put_slice(param);
                }
                ComponentTag::Invoke
            }
            Self::ReturnResultLast {
                invoke_id,
                operation_code,
                parameter,
            } => {
                encode_result(&mut content, *invoke_id, *operation_code, parameter.as_ref());
                ComponentTag::ReturnResultLast
            }
            Self::ReturnResultNotLast {
                invoke_id,
                operation_code,
                parameter,
            } => {
                encode_result(&mut content, *invoke_id, *operation_code, parameter.as_ref());
                ComponentTag::ReturnResultNotLast
            }
            Self::ReturnError {
                invoke_id,
                error_code,
                parameter,
            } => {
                asn1::encode_integer(&mut content, tag::INTEGER, *invoke_id);
                asn1::encode_integer(&mut content, tag::INTEGER, *error_code);
                if let Some(param) = parameter {
                    content.put_slice(param);
                }
                ComponentTag::ReturnError
            }
            Self::Reject { invoke_id, problem } => {
                match invoke_id {
                    Some(id) => asn1::encode_integer(&mut content, tag::INTEGER, *id),
                    None => asn1::encode_tagged(&mut content, REJECT_INVOKE_ID_NULL, &[]),
                }
                asn1::encode_tagged(&mut content, problem.tag(), &[problem.code()]);
                ComponentTag::Reject
            }
        };

        asn1::encode_tagged(buf, component_tag as u8, &content);
    }

    /// Decode one component from its tag and content octets
    pub fn decode(component_tag: u8, content: &[u8]) -> Result<Self, TcapError> {
        let mut items = asn1::iter(content);

        match component_tag {
            t if t == ComponentTag::Invoke as u8 => {
                let invoke_id = next_item(&mut items, "invoke id")?.expect(tag::INTEGER)?.integer()?;
                let mut item = next_item(&mut items, "operation code")?;
                let mut linked_id = None;
                if item.tag == LINKED_ID {
                    linked_id = Some(item.integer()?);
                    item = next_item(&mut items, "operation code")?;
                }
                let operation_code = item.expect(tag::INTEGER)?.integer()?;
                let parameter = remaining(&mut items)?;
                Ok(Self::Invoke {
                    invoke_id,
                    linked_id,
                    operation_code,
                    parameter,
                })
            }
            t if t == ComponentTag::ReturnResultLast as u8
                || t == ComponentTag::ReturnResultNotLast as u8 =>
            {
                let invoke_id = next_item(&mut items, "invoke id")?.expect(tag::INTEGER)?.integer()?;
                let (operation_code, parameter) = match items.next().transpose()? {
                    Some(result) => {
                        let result = result.expect(tag::SEQUENCE)?;
                        let mut inner = asn1::iter(result.value);
                        let op = inner
                            .next()
                            .transpose()?
                            .ok_or_else(|| TcapError::ComponentError("empty result".to_string()))?
                            .expect(tag::INTEGER)?
                            .integer()?;
                        (Some(op), remaining(&mut inner)?)
                    }
                    None => (None, None),
                };
                if t == ComponentTag::ReturnResultLast as u8 {
                    Ok(Self::ReturnResultLast {
                        invoke_id,
                        operation_code,
                        parameter,
                    })
                } else {
                    Ok(Self::ReturnResultNotLast {
                        invoke_id,
                        operation_code,
                        parameter,
                    })
                }
            }
            t if t == ComponentTag::ReturnError as u8 => {
                let invoke_id = next_item(&mut items, "invoke id")?.expect(tag::INTEGER)?.integer()?;
                let error_code = next_item(&mut items, "error code")?.expect(tag::INTEGER)?.integer()?;
                let parameter = remaining(&mut items)?;
                Ok(Self::ReturnError {
                    invoke_id,
                    error_code,
                    parameter,
                })
            }
            t if t == ComponentTag::Reject as u8 => {
                let id = next_item(&mut items, "invoke id")?;
                let invoke_id = match id.tag {
                    tag::INTEGER => Some(id.integer()?),
                    REJECT_INVOKE_ID_NULL => None,
                    other => return Err(TcapError::UnexpectedTag(other)),
                };
                let problem = Problem::from_tlv(next_item(&mut items, "problem")?)?;
                Ok(Self::Reject { invoke_id, problem })
            }
            other => Err(TcapError::UnexpectedTag(other)),
        }
    }
}

fn encode_result(
    content: &mut BytesMut,
    invoke_id: i32,
    operation_code: Option<i32>,
    parameter: Option<&Bytes>,
) {
    asn1::encode_integer(content, tag::INTEGER, invoke_id);
    if let Some(op) = operation_code {
        let mut result = BytesMut::new();
        asn1::encode_integer(&mut result, tag::INTEGER, op);
        if let Some(param) = parameter {
            result.put_slice(param);
        }
        asn1::encode_tagged(content, tag::SEQUENCE, &result);
    }
}

fn next_item<'a>(items: &mut asn1::TlvIter<'a>, what: &str) -> Result<asn1::Tlv<'a>, TcapError> {
    items
        .next()
        .unwrap_or_else(|| Err(TcapError::ComponentError(format!("missing {}", what))))
}

/// Re-encode whatever follows as a single parameter TLV
fn remaining(items: &mut asn1::TlvIter<'_>) -> Result<Option<Bytes>, TcapError> {
    match items.next().transpose()? {
        Some(tlv) => {
            let mut buf = BytesMut::new();
            asn1::encode_tagged(&mut buf, tlv.tag, tlv.value);
            Ok(Some(buf.freeze()))
        }
        None => Ok(None),
    }
}

/// Encode a component portion body
pub fn encode_all(components: &[Component]) -> BytesMut {
    let mut buf = BytesMut::new();
    for component in components {
        component.encode(&mut buf);
    }
    buf
}

/// Parse a component portion body
pub fn decode_all(data: &[u8]) -> Result<Vec<Component>, TcapError> {
    asn1::iter(data)
        .map(|tlv| tlv.and_then(|tlv| Component::decode(tlv.tag, tlv.value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(component: Component) -> Component {
        let encoded = encode_all(std::slice::from_ref(&component));
        let mut decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.remove(0)
    }

    #[test]
    fn test_invoke_encoding() {
        let component = Component::Invoke {
            invoke_id: 1,
            linked_id: None,
            operation_code: 44,
            parameter: Some(Bytes::from_static(&[0x30, 0x03, 0x80, 0x01, 0xFF])),
        };
        let encoded = encode_all(std::slice::from_ref(&component));
        assert_eq!(
            &encoded[..],
            &[0xA1, 0x0B, 0x02, 0x01, 0x01, 0x02, 0x01, 0x2C, 0x30, 0x03, 0x80, 0x01, 0xFF]
        );
        assert_eq!(roundtrip(component.clone()), component);
    }

    #[test]
    fn test_invoke_with_linked_id() {
        let component = Component::Invoke {
            invoke_id: -3,
            linked_id: Some(2),
            operation_code: 46,
            parameter: None,
        };
        assert_eq!(roundtrip(component.clone()), component);
    }

    #[test]
    fn test_return_result_variants() {
        let empty = Component::ReturnResultLast {
            invoke_id: 1,
            operation_code: None,
            parameter: None,
        };
        assert_eq!(roundtrip(empty.clone()), empty);

        let full = Component::ReturnResultNotLast {
            invoke_id: 1,
            operation_code: Some(44),
            parameter: Some(Bytes::from_static(&[0x04, 0x01, 0x00])),
        };
        assert_eq!(roundtrip(full.clone()), full);
    }

    #[test]
    fn test_return_error() {
        let component = Component::ReturnError {
            invoke_id: 1,
            error_code: 36,
            parameter: None,
        };
        assert_eq!(roundtrip(component.clone()), component);
    }

    #[test]
    fn test_reject_decoding() {
        let component = Component::Reject {
            invoke_id: Some(5),
            problem: Problem::UNRECOGNIZED_OPERATION,
        };
        assert_eq!(roundtrip(component.clone()), component);

        // Reject with NULL invoke id, general problem mistypedComponent
        let raw = [0xA4, 0x05, 0x05, 0x00, 0x80, 0x01, 0x01];
        let decoded = decode_all(&raw).unwrap();
        assert_eq!(
            decoded[0],
            Component::Reject {
                invoke_id: None,
                problem: Problem::MISTYPED_COMPONENT
            }
        );
    }

    #[test]
    fn test_unknown_component_rejected() {
        assert!(matches!(
            decode_all(&[0xA9, 0x00]),
            Err(TcapError::UnexpectedTag(0xA9))
        ));
        assert!(decode_all(&[0xA1, 0x03, 0x02, 0x01, 0x01]).is_err());
    }
}
