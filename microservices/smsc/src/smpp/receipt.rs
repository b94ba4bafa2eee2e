//! Delivery receipt text carried in `deliver_sm` with ESM class 0x04

use bytes::Bytes;
use chrono::{DateTime, Utc};
use smsc_core::{Message, MessageStatus};

use super::pdu::{tag, SmBody, Tlv};
use super::time::receipt_stamp;

/// ESM class marking a `deliver_sm` as a delivery receipt
pub const ESM_CLASS_RECEIPT: u8 = 0x04;

/// SMPP `message_state` values
pub mod state {
    pub const DELIVERED: u8 = 2;
    pub const EXPIRED: u8 = 3;
    pub const UNDELIVERABLE: u8 = 5;
    pub const REJECTED: u8 = 8;
}

/// Final outcome reported to the originator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: String,
    pub submitted: DateTime<Utc>,
    pub done: DateTime<Utc>,
    pub status: MessageStatus,
    pub error: u16,
    pub text: String,
}

impl Receipt {
    /// Receipt for a message in a terminal state, `None` otherwise
    pub fn for_message(message: &Message) -> Option<Self> {
        if !message.status.is_terminal() {
            return None;
        }
        let text: String = String::from_utf8_lossy(&message.content)
            .chars()
            .take(20)
            .collect();
        Some(Self {
            message_id: message.id.to_string(),
            submitted: message.created_at,
            done: message.updated_at,
            status: message.status,
            error: if message.status == MessageStatus::Delivered {
                0
            } else {
                1
            },
            text,
        })
    }

    pub fn stat(&self) -> &'static str {
        match self.status {
            MessageStatus::Delivered => "DELIVRD",
            MessageStatus::Expired => "EXPIRED",
            MessageStatus::Rejected => "REJECTD",
            _ => "UNDELIV",
        }
    }

    fn message_state(&self) -> u8 {
        match self.status {
            MessageStatus::Delivered => state::DELIVERED,
            MessageStatus::Expired => state::EXPIRED,
            MessageStatus::Rejected => state::REJECTED,
            _ => state::UNDELIVERABLE,
        }
    }

    pub fn to_text(&self) -> String {
        let delivered = u8::from(self.status == MessageStatus::Delivered);
        format!(
            "id:{} sub:001 dlvrd:{:03} submit date:{} done date:{} stat:{} err:{:03} text:{}",
            self.message_id,
            delivered,
            receipt_stamp(self.submitted),
            receipt_stamp(self.done),
            self.stat(),
            self.error,
            self.text,
        )
    }

    /// `deliver_sm` body sent back to the submitting ESME; addresses are
    /// swapped relative to the original submission
    pub fn to_deliver_sm(&self, message: &Message) -> SmBody {
        let mut receipted_id = self.message_id.clone().into_bytes();
        receipted_id.push(0);
        SmBody {
            source_addr_ton: message.destination.ton,
            source_addr_npi: message.destination.npi,
            source_addr: message.destination.digits.clone(),
            dest_addr_ton: message.source.ton,
            dest_addr_npi: message.source.npi,
            destination_addr: message.source.digits.clone(),
            esm_class: ESM_CLASS_RECEIPT,
            short_message: Bytes::from(self.to_text()),
            tlvs: vec![
                Tlv::new(tag::RECEIPTED_MESSAGE_ID, receipted_id),
                Tlv::new(tag::MESSAGE_STATE, vec![self.message_state()]),
            ],
            ..Default::default()
        }
    }
}

/// Fields extracted from a receipt received from a downstream SMSC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReceipt {
    pub message_id: String,
    pub delivered: bool,
    pub stat: String,
}

/// Parse a receipt `deliver_sm`. The `receipted_message_id` and
/// `message_state` TLVs win over the text when present.
pub fn parse(sm: &SmBody) -> Option<ParsedReceipt> {
    if sm.esm_class & 0x3C != ESM_CLASS_RECEIPT {
        return None;
    }
    let text = String::from_utf8_lossy(sm.content()).into_owned();
    let field = |key: &str| {
        text.split_whitespace()
            .find_map(|part| part.strip_prefix(key))
            .map(str::to_string)
    };

    let message_id = sm
        .tlv(tag::RECEIPTED_MESSAGE_ID)
        .map(|t| {
            String::from_utf8_lossy(&t.value)
                .trim_end_matches('\0')
                .to_string()
        })
        .or_else(|| field("id:"))?;

    let stat = field("stat:").unwrap_or_default();
    let delivered = match sm.tlv(tag::MESSAGE_STATE).and_then(|t| t.value.first()) {
        Some(&value) => value == state::DELIVERED,
        None => stat == "DELIVRD",
    };

    Some(ParsedReceipt {
        message_id,
        delivered,
        stat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use smsc_core::Address;

    fn finished(status: MessageStatus) -> Message {
        let mut msg = Message::new(
            Address::international("15550001"),
            Address::international("15551234"),
            b"hello world".to_vec(),
        );
        msg.id = smsc_core::MessageId("abc123".to_string());
        msg.created_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        msg.updated_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 1, 0).unwrap();
        msg.status = status;
        msg
    }

    #[test]
    fn test_receipt_text() {
        let receipt = Receipt::for_message(&finished(MessageStatus::Delivered)).unwrap();
        assert_eq!(
            receipt.to_text(),
            "id:abc123 sub:001 dlvrd:001 submit date:2603010900 done date:2603010901 \
             stat:DELIVRD err:000 text:hello world"
        );
    }

    #[test]
    fn test_no_receipt_before_terminal() {
        assert!(Receipt::for_message(&finished(MessageStatus::Sent)).is_none());
    }

    #[test]
    fn test_deliver_sm_swaps_addresses() {
        let msg = finished(MessageStatus::Expired);
        let sm = Receipt::for_message(&msg).unwrap().to_deliver_sm(&msg);
        assert_eq!(sm.source_addr, "15551234");
        assert_eq!(sm.destination_addr, "15550001");
        assert_eq!(sm.esm_class, ESM_CLASS_RECEIPT);
        assert_eq!(sm.tlv(tag::MESSAGE_STATE).unwrap().value[0], state::EXPIRED);
    }

    #[test]
    fn test_parse_own_receipt() {
        let msg = finished(MessageStatus::Failed);
        let sm = Receipt::for_message(&msg).unwrap().to_deliver_sm(&msg);
        let parsed = parse(&sm).unwrap();
        assert_eq!(parsed.message_id, "abc123");
        assert!(!parsed.delivered);
        assert_eq!(parsed.stat, "UNDELIV");
    }

    #[test]
    fn test_parse_text_only() {
        let sm = SmBody {
            esm_class: ESM_CLASS_RECEIPT,
            short_message: Bytes::from_static(
                b"id:77 sub:001 dlvrd:001 submit date:2603010900 done date:2603010901 stat:DELIVRD err:000 text:",
            ),
            ..Default::default()
        };
        let parsed = parse(&sm).unwrap();
        assert_eq!(parsed.message_id, "77");
        assert!(parsed.delivered);
    }

    #[test]
    fn test_plain_deliver_is_not_receipt() {
        let sm = SmBody {
            short_message: Bytes::from_static(b"id:1 stat:DELIVRD"),
            ..Default::default()
        };
        assert!(parse(&sm).is_none());
    }
}
