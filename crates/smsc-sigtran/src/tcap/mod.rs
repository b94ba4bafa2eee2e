//! TCAP (Transaction Capabilities Application Part)
//!
//! ITU-T Q.773 message and dialogue portion encoding. Transactions are
//! tracked by the stack, which keys them on the local transaction id.

pub mod asn1;
mod components;

pub use components::{Component, ComponentTag, Problem};

use bytes::{Bytes, BytesMut};

use crate::errors::TcapError;
use asn1::tag;

/// Dialogue-as-id: {itu-t recommendation q 773 as(1) dialogue-as(1) version1(1)}
pub const DIALOGUE_AS_ID: [u32; 7] = [0, 0, 17, 773, 1, 1, 1];

/// ASN.1 Tags for TCAP
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum TcapTag {
    Begin = 0x62,
    End = 0x64,
    Continue = 0x65,
    Abort = 0x67,
    OriginatingTransactionId = 0x48,
    DestinationTransactionId = 0x49,
    PAbortCause = 0x4A,
    DialoguePortion = 0x6B,
    ComponentPortion = 0x6C,
}

/// Dialogue PDU tags inside the EXTERNAL single-ASN1-type
mod dialogue_tag {
    pub const SINGLE_ASN1_TYPE: u8 = 0xA0;
    pub const AARQ: u8 = 0x60;
    pub const AARE: u8 = 0x61;
    pub const ABRT: u8 = 0x64;
    pub const PROTOCOL_VERSION: u8 = 0x80;
    pub const APPLICATION_CONTEXT: u8 = 0xA1;
    pub const RESULT: u8 = 0xA2;
    pub const RESULT_SOURCE_DIAGNOSTIC: u8 = 0xA3;
    pub const SERVICE_USER: u8 = 0xA1;
}

/// P-abort causes
pub mod p_abort {
    pub const UNRECOGNIZED_MESSAGE_TYPE: u8 = 0;
    pub const UNRECOGNIZED_TRANSACTION_ID: u8 = 1;
    pub const BADLY_FORMATTED_TRANSACTION_PORTION: u8 = 2;
    pub const INCORRECT_TRANSACTION_PORTION: u8 = 3;
    pub const RESOURCE_LIMITATION: u8 = 4;
}

/// TCAP Message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcapMessage {
    Begin {
        originating_transaction_id: Vec<u8>,
        dialogue_portion: Option<DialoguePortion>,
        component_portion: Vec<Component>,
    },
    Continue {
        originating_transaction_id: Vec<u8>,
        destination_transaction_id: Vec<u8>,
        dialogue_portion: Option<DialoguePortion>,
        component_portion: Vec<Component>,
    },
    End {
        destination_transaction_id: Vec<u8>,
        dialogue_portion: Option<DialoguePortion>,
        component_portion: Vec<Component>,
    },
    Abort {
        destination_transaction_id: Vec<u8>,
        cause: AbortCause,
    },
}

/// Structured dialogue portion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialoguePortion {
    /// AARQ carrying the proposed application context
    Request { application_context_name: Vec<u32> },
    /// AARE; result 0 accepts the context
    Response {
        application_context_name: Vec<u32>,
        result: u8,
    },
    /// ABRT from the dialogue service user
    UserAbort,
}

impl DialoguePortion {
    pub fn request(application_context_name: &[u32]) -> Self {
        Self::Request {
            application_context_name: application_context_name.to_vec(),
        }
    }

    pub fn accept(application_context_name: &[u32]) -> Self {
        Self::Response {
            application_context_name: application_context_name.to_vec(),
            result: 0,
        }
    }

    pub fn application_context_name(&self) -> Option<&[u32]> {
        match self {
            Self::Request {
                application_context_name,
            }
            | Self::Response {
                application_context_name,
                ..
            } => Some(application_context_name),
            Self::UserAbort => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut pdu = BytesMut::new();
        let pdu_tag = match self {
            Self::Request {
                application_context_name,
            } => {
                asn1::encode_tagged(&mut pdu, dialogue_tag::PROTOCOL_VERSION, &[0x07, 0x80]);
                asn1::encode_tagged(
                    &mut pdu,
                    dialogue_tag::APPLICATION_CONTEXT,
                    &asn1::encode_oid(application_context_name),
                );
                dialogue_tag::AARQ
            }
            Self::Response {
                application_context_name,
                result,
            } => {
                asn1::encode_tagged(&mut pdu, dialogue_tag::PROTOCOL_VERSION, &[0x07, 0x80]);
                asn1::encode_tagged(
                    &mut pdu,
                    dialogue_tag::APPLICATION_CONTEXT,
                    &asn1::encode_oid(application_context_name),
                );
                let mut result_value = BytesMut::new();
                asn1::encode_integer(&mut result_value, tag::INTEGER, *result as i32);
                asn1::encode_tagged(&mut pdu, dialogue_tag::RESULT, &result_value);

                let mut diagnostic = BytesMut::new();
                asn1::encode_integer(&mut diagnostic, tag::INTEGER, 0);
                let mut source = BytesMut::new();
                asn1::encode_tagged(&mut source, dialogue_tag::SERVICE_USER, &diagnostic);
                asn1::encode_tagged(&mut pdu, dialogue_tag::RESULT_SOURCE_DIAGNOSTIC, &source);
                dialogue_tag::AARE
            }
            Self::UserAbort => {
                // abort-source: dialogue-service-user
                asn1::encode_tagged(&mut pdu, 0x80, &[0x00]);
                dialogue_tag::ABRT
            }
        };

        let mut single = BytesMut::new();
        asn1::encode_tagged(&mut single, pdu_tag, &pdu);

        let mut external = BytesMut::new();
        external.extend_from_slice(&asn1::encode_oid(&DIALOGUE_AS_ID));
        asn1::encode_tagged(&mut external, dialogue_tag::SINGLE_ASN1_TYPE, &single);

        let mut portion = BytesMut::new();
        asn1::encode_tagged(&mut portion, tag::EXTERNAL, &external);
        asn1::encode_tagged(buf, TcapTag::DialoguePortion as u8, &portion);
    }

    fn decode(value: &[u8]) -> Result<Self, TcapError> {
        let (external, _) = asn1::read_tlv(value)?;
        let external = external.expect(tag::EXTERNAL)?;

        let single = asn1::iter(external.value)
            .find(|tlv| {
                tlv.as_ref()
                    .map(|tlv| tlv.tag == dialogue_tag::SINGLE_ASN1_TYPE)
                    .unwrap_or(true)
            })
            .transpose()?
            .ok_or_else(|| TcapError::Asn1Error("dialogue without PDU".to_string()))?;
        let (pdu, _) = asn1::read_tlv(single.value)?;

        if pdu.tag == dialogue_tag::ABRT {
            return Ok(Self::UserAbort);
        }
        if pdu.tag != dialogue_tag::AARQ && pdu.tag != dialogue_tag::AARE {
            return Err(TcapError::UnexpectedTag(pdu.tag));
        }

        let mut application_context_name = None;
        let mut result = 0u8;
        for item in asn1::iter(pdu.value) {
            let item = item?;
            match item.tag {
                dialogue_tag::APPLICATION_CONTEXT => {
                    let (oid, _) = asn1::read_tlv(item.value)?;
                    application_context_name = Some(asn1::decode_oid(oid.expect(tag::OID)?.value)?);
                }
                dialogue_tag::RESULT => {
                    let (value, _) = asn1::read_tlv(item.value)?;
                    result = value.integer()? as u8;
                }
                _ => {}
            }
        }
        let application_context_name = application_context_name
            .ok_or_else(|| TcapError::Asn1Error("missing application context".to_string()))?;

        if pdu.tag == dialogue_tag::AARQ {
            Ok(Self::Request {
                application_context_name,
            })
        } else {
            Ok(Self::Response {
                application_context_name,
                result,
            })
        }
    }
}

/// Abort Cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// Protocol abort from the peer's TCAP layer
    Provider(u8),
    /// Abort requested by the peer's TC-user
    User,
}

/// Encode a 32-bit local transaction id
pub fn transaction_id(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Interpret a transaction id of one to four octets as an integer
pub fn transaction_id_value(id: &[u8]) -> Option<u32> {
    if id.is_empty() || id.len() > 4 {
        return None;
    }
    Some(id.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

impl TcapMessage {
    /// Get message tag
    pub fn tag(&self) -> u8 {
        match self {
            Self::Begin { .. } => TcapTag::Begin as u8,
            Self::Continue { .. } => TcapTag::Continue as u8,
            Self::End { .. } => TcapTag::End as u8,
            Self::Abort { .. } => TcapTag::Abort as u8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "BEGIN",
            Self::Continue { .. } => "CONTINUE",
            Self::End { .. } => "END",
            Self::Abort { .. } => "ABORT",
        }
    }

    pub fn originating_transaction_id(&self) -> Option<&[u8]> {
        match self {
            Self::Begin {
                originating_transaction_id,
                ..
            }
            | Self::Continue {
                originating_transaction_id,
                ..
            } => Some(originating_transaction_id),
            _ => None,
        }
    }

    pub fn destination_transaction_id(&self) -> Option<&[u8]> {
        match self {
            Self::Continue {
                destination_transaction_id,
                ..
            }
            | Self::End {
                destination_transaction_id,
                ..
            }
            | Self::Abort {
                destination_transaction_id,
                ..
            } => Some(destination_transaction_id),
            Self::Begin { .. } => None,
        }
    }

    pub fn components(&self) -> &[Component] {
        match self {
            Self::Begin {
                component_portion, ..
            }
            | Self::Continue {
                component_portion, ..
            }
            | Self::End {
                component_portion, ..
            } => component_portion,
            Self::Abort { .. } => &[],
        }
    }

    pub fn dialogue_portion(&self) -> Option<&DialoguePortion> {
        match self {
            Self::Begin {
                dialogue_portion, ..
            }
            | Self::Continue {
                dialogue_portion, ..
            }
            | Self::End {
                dialogue_portion, ..
            } => dialogue_portion.as_ref(),
            Self::Abort { .. } => None,
        }
    }

    /// Encode to ASN.1 BER
    pub fn encode(&self) -> Bytes {
        let mut content = BytesMut::new();

        if let Some(otid) = self.originating_transaction_id() {
            asn1::encode_tagged(&mut content, TcapTag::OriginatingTransactionId as u8, otid);
        }
        if let Some(dtid) = self.destination_transaction_id() {
            asn1::encode_tagged(&mut content, TcapTag::DestinationTransactionId as u8, dtid);
        }

        match self {
            Self::Abort { cause, .. } => match cause {
                AbortCause::Provider(cause) => {
                    asn1::encode_tagged(&mut content, TcapTag::PAbortCause as u8, &[*cause]);
                }
                AbortCause::User => DialoguePortion::UserAbort.encode(&mut content),
            },
            _ => {
                if let Some(dialogue) = self.dialogue_portion() {
                    dialogue.encode(&mut content);
                }
                let components = self.components();
                if !components.is_empty() {
                    let body = components::encode_all(components);
                    asn1::encode_tagged(&mut content, TcapTag::ComponentPortion as u8, &body);
                }
            }
        }

        let mut buf = BytesMut::with_capacity(content.len() + 4);
        asn1::encode_tagged(&mut buf, self.tag(), &content);
        buf.freeze()
    }

    /// Decode from ASN.1 BER
    pub fn decode(data: &[u8]) -> Result<Self, TcapError> {
        let (message, _) = asn1::read_tlv(data)?;

        let mut otid = None;
        let mut dtid = None;
        let mut dialogue = None;
        let mut components = Vec::new();
        let mut p_abort = None;

        for item in asn1::iter(message.value) {
            let item = item?;
            match item.tag {
                t if t == TcapTag::OriginatingTransactionId as u8 => otid = Some(item.value.to_vec()),
                t if t == TcapTag::DestinationTransactionId as u8 => dtid = Some(item.value.to_vec()),
                t if t == TcapTag::DialoguePortion as u8 => {
                    dialogue = Some(DialoguePortion::decode(item.value)?)
                }
                t if t == TcapTag::ComponentPortion as u8 => {
                    components = components::decode_all(item.value)?
                }
                t if t == TcapTag::PAbortCause as u8 => {
                    p_abort = Some(item.value.first().copied().unwrap_or(0))
                }
                other => return Err(TcapError::UnexpectedTag(other)),
            }
        }

        let missing = |what: &str| TcapError::Asn1Error(format!("missing {}", what));

        match message.tag {
            t if t == TcapTag::Begin as u8 => Ok(Self::Begin {
                originating_transaction_id: otid.ok_or_else(|| missing("otid"))?,
                dialogue_portion: dialogue,
                component_portion: components,
            }),
            t if t == TcapTag::Continue as u8 => Ok(Self::Continue {
                originating_transaction_id: otid.ok_or_else(|| missing("otid"))?,
                destination_transaction_id: dtid.ok_or_else(|| missing("dtid"))?,
                dialogue_portion: dialogue,
                component_portion: components,
            }),
            t if t == TcapTag::End as u8 => Ok(Self::End {
                destination_transaction_id: dtid.ok_or_else(|| missing("dtid"))?,
                dialogue_portion: dialogue,
                component_portion: components,
            }),
            t if t == TcapTag::Abort as u8 => Ok(Self::Abort {
                destination_transaction_id: dtid.ok_or_else(|| missing("dtid"))?,
                cause: p_abort.map(AbortCause::Provider).unwrap_or(AbortCause::User),
            }),
            other => Err(TcapError::UnexpectedTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AC: [u32; 8] = [0, 4, 0, 0, 1, 0, 25, 3];

    fn invoke() -> Component {
        Component::Invoke {
            invoke_id: 1,
            linked_id: None,
            operation_code: 44,
            parameter: Some(Bytes::from_static(&[0x30, 0x00])),
        }
    }

    #[test]
    fn test_begin_roundtrip() {
        let begin = TcapMessage::Begin {
            originating_transaction_id: transaction_id(0x0102_0304),
            dialogue_portion: Some(DialoguePortion::request(&AC)),
            component_portion: vec![invoke()],
        };
        let encoded = begin.encode();
        assert_eq!(encoded[0], 0x62);
        assert_eq!(&encoded[2..8], &[0x48, 0x04, 0x01, 0x02, 0x03, 0x04]);

        let decoded = TcapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, begin);
        assert_eq!(
            decoded.dialogue_portion().and_then(|d| d.application_context_name()),
            Some(&AC[..])
        );
    }

    #[test]
    fn test_continue_keeps_both_ids() {
        let cont = TcapMessage::Continue {
            originating_transaction_id: vec![0xAA, 0xBB],
            destination_transaction_id: vec![0x01, 0x02, 0x03, 0x04],
            dialogue_portion: None,
            component_portion: vec![],
        };
        let decoded = TcapMessage::decode(&cont.encode()).unwrap();
        assert_eq!(decoded.originating_transaction_id(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(
            decoded.destination_transaction_id(),
            Some(&[0x01, 0x02, 0x03, 0x04][..])
        );
    }

    #[test]
    fn test_end_with_accept() {
        let end = TcapMessage::End {
            destination_transaction_id: transaction_id(7),
            dialogue_portion: Some(DialoguePortion::accept(&AC)),
            component_portion: vec![Component::ReturnResultLast {
                invoke_id: 1,
                operation_code: None,
                parameter: None,
            }],
        };
        assert_eq!(TcapMessage::decode(&end.encode()).unwrap(), end);
    }

    #[test]
    fn test_abort_causes() {
        let p_abort = TcapMessage::Abort {
            destination_transaction_id: transaction_id(9),
            cause: AbortCause::Provider(p_abort::UNRECOGNIZED_TRANSACTION_ID),
        };
        let encoded = p_abort.encode();
        assert_eq!(
            &encoded[..],
            &[0x67, 0x09, 0x49, 0x04, 0, 0, 0, 9, 0x4A, 0x01, 0x01]
        );
        assert_eq!(TcapMessage::decode(&encoded).unwrap(), p_abort);

        let u_abort = TcapMessage::Abort {
            destination_transaction_id: transaction_id(9),
            cause: AbortCause::User,
        };
        assert_eq!(TcapMessage::decode(&u_abort.encode()).unwrap(), u_abort);
    }

    #[test]
    fn test_transaction_id_value() {
        assert_eq!(transaction_id_value(&transaction_id(0xDEAD_BEEF)), Some(0xDEAD_BEEF));
        assert_eq!(transaction_id_value(&[0x01]), Some(1));
        assert_eq!(transaction_id_value(&[]), None);
        assert_eq!(transaction_id_value(&[0; 5]), None);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(TcapMessage::decode(&[]).is_err());
        assert!(TcapMessage::decode(&[0x61, 0x00]).is_err());
        // BEGIN without otid
        assert!(TcapMessage::decode(&[0x62, 0x00]).is_err());
    }
}
