//! Core domain types shared by the gateway, the Sigtran stack and storage

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Default validity period applied when the submitter does not give one (24h).
pub const DEFAULT_VALIDITY_SECS: u64 = 24 * 60 * 60;

/// Validity periods are clamped to ten years.
pub const MAX_VALIDITY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Unique message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Downstream operator identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message priority levels, mapped one to one on the SMPP `priority_flag`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Urgent,
        }
    }

    pub fn as_flag(self) -> u8 {
        self as u8
    }
}

/// Message status
///
/// Moves forward only: `scheduled -> pending -> {sent -> delivered | failed} | expired | rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Scheduled,
    Pending,
    Sent,
    Delivered,
    Failed,
    Expired,
    Rejected,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::Expired | Self::Rejected
        )
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Scheduled, Pending)
                | (Scheduled, Expired)
                | (Scheduled, Rejected)
                | (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Pending, Rejected)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Sent, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// Character set of the short message body, derived from SMPP `data_coding`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Gsm7,
    Latin1,
    Binary,
    Ucs2,
}

impl Encoding {
    pub fn from_data_coding(dc: u8) -> Self {
        match dc {
            0x00 | 0x01 => Self::Gsm7,
            0x03 => Self::Latin1,
            0x08 => Self::Ucs2,
            dc if dc & 0xF0 == 0xF0 => {
                if dc & 0x04 != 0 {
                    Self::Binary
                } else {
                    Self::Gsm7
                }
            }
            _ => Self::Binary,
        }
    }

    pub fn data_coding(self) -> u8 {
        match self {
            Self::Gsm7 => 0x00,
            Self::Latin1 => 0x03,
            Self::Binary => 0x04,
            Self::Ucs2 => 0x08,
        }
    }

    /// Largest `short_message` body, in octets, that fits one SMS for this encoding.
    ///
    /// GSM7 content travels unpacked (one septet per octet), so its limit is the
    /// 160 character limit; UCS2 uses two octets per character for 70 characters.
    pub fn max_single_octets(self) -> usize {
        match self {
            Self::Gsm7 => 160,
            Self::Latin1 | Self::Binary | Self::Ucs2 => 140,
        }
    }
}

/// SMPP-style address: Type of Number, Numbering Plan Indicator and digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ton: u8,
    pub npi: u8,
    pub digits: String,
}

impl Address {
    /// International ISDN address (TON 1, NPI 1)
    pub fn international(digits: impl Into<String>) -> Self {
        Self {
            ton: 1,
            npi: 1,
            digits: digits.into(),
        }
    }

    pub fn new(ton: u8, npi: u8, digits: impl Into<String>) -> Self {
        Self {
            ton,
            npi,
            digits: digits.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digits)
    }
}

/// Optional parameter carried opaquely so relays can forward it unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalParam {
    pub tag: u16,
    pub value: Vec<u8>,
}

/// Which inbound path created the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Smpp,
    Sigtran,
}

/// A short message moving through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub origin: Origin,
    /// SMPP system id (or Sigtran remote name) the message came from
    pub client_id: Option<String>,
    pub source: Address,
    pub destination: Address,
    pub content: Vec<u8>,
    pub data_coding: u8,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub service_type: String,
    pub registered_delivery: u8,
    pub priority: Priority,
    pub validity_secs: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub operator_id: Option<OperatorId>,
    pub optional_params: Vec<OptionalParam>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(source: Address, destination: Address, content: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::generate(),
            origin: Origin::Smpp,
            client_id: None,
            source,
            destination,
            content: content.into(),
            data_coding: 0,
            esm_class: 0,
            protocol_id: 0,
            service_type: String::new(),
            registered_delivery: 0,
            priority: Priority::Normal,
            validity_secs: DEFAULT_VALIDITY_SECS,
            scheduled_at: None,
            status: MessageStatus::Pending,
            retry_count: 0,
            last_error: None,
            operator_id: None,
            optional_params: Vec::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::from_data_coding(self.data_coding)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = self.validity_secs.min(MAX_VALIDITY_SECS) as i64;
        self.created_at + ChronoDuration::seconds(secs)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True while the retry budget is not spent and the validity window is open
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries && !self.is_expired()
    }

    pub fn wants_receipt(&self) -> bool {
        self.registered_delivery & 0x03 != 0
    }

    pub fn transition(&mut self, next: MessageStatus) -> Result<(), StatusTransitionError> {
        self.transition_at(next, Utc::now())
    }

    pub fn transition_at(
        &mut self,
        next: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        match next {
            MessageStatus::Sent => self.sent_at = Some(at),
            MessageStatus::Delivered => self.delivered_at = Some(at),
            _ => {}
        }
        Ok(())
    }
}

/// Operator availability as set by administrators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Active,
    Disabled,
}

impl Default for OperatorStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl OperatorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

/// How the gateway reaches an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportBinding {
    Smpp {
        host: String,
        port: u16,
        system_id: String,
        password: String,
        #[serde(default)]
        system_type: String,
    },
    Sigtran {
        remote: String,
    },
    /// No outbound path configured; dispatch fails as unavailable
    None,
}

impl Default for TransportBinding {
    fn default() -> Self {
        Self::None
    }
}

/// Operator definition as stored and configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub id: OperatorId,
    pub name: String,
    /// Lower is preferred
    #[serde(default = "default_operator_priority")]
    pub priority: u32,
    #[serde(default = "default_operator_weight")]
    pub weight: u32,
    pub max_tps: u32,
    #[serde(default)]
    pub status: OperatorStatus,
    #[serde(default)]
    pub transport: TransportBinding,
}

fn default_operator_priority() -> u32 {
    1
}

fn default_operator_weight() -> u32 {
    100
}

/// Routing rule mapping a destination prefix (or `*`) to an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    pub operator_id: OperatorId,
    #[serde(default = "default_operator_priority")]
    pub priority: u32,
    /// Overrides the operator weight for this rule only
    #[serde(default)]
    pub weight: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new(
            Address::international("15550001"),
            Address::international("15551234"),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn test_message_defaults() {
        let msg = message();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.validity_secs, DEFAULT_VALIDITY_SECS);
        assert_eq!(msg.encoding(), Encoding::Gsm7);
        assert_eq!(msg.source.ton, 1);
        assert_eq!(msg.source.npi, 1);
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut msg = message();
        msg.transition(MessageStatus::Sent).unwrap();
        assert!(msg.sent_at.is_some());
        msg.transition(MessageStatus::Delivered).unwrap();
        assert!(msg.delivered_at.is_some());

        let err = msg.transition(MessageStatus::Pending).unwrap_err();
        assert_eq!(err.from, MessageStatus::Delivered);
        assert!(msg.transition(MessageStatus::Failed).is_err());
        assert_eq!(msg.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        use MessageStatus::*;
        let all = [Scheduled, Pending, Sent, Delivered, Failed, Expired, Rejected];
        for from in all.iter().copied().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let mut msg = message();
        msg.validity_secs = 60;
        let created = msg.created_at;
        assert!(!msg.is_expired_at(created + ChronoDuration::seconds(60)));
        assert!(msg.is_expired_at(created + ChronoDuration::seconds(61)));
    }

    #[test]
    fn test_can_retry() {
        let mut msg = message();
        assert!(msg.can_retry(3));
        msg.retry_count = 3;
        assert!(!msg.can_retry(3));

        let mut old = message();
        old.validity_secs = 1;
        old.created_at = Utc::now() - ChronoDuration::seconds(10);
        assert!(!old.can_retry(3));
    }

    #[test]
    fn test_encoding_from_data_coding() {
        assert_eq!(Encoding::from_data_coding(0x08), Encoding::Ucs2);
        assert_eq!(Encoding::from_data_coding(0x03), Encoding::Latin1);
        assert_eq!(Encoding::from_data_coding(0x04), Encoding::Binary);
        assert_eq!(Encoding::from_data_coding(0xF0), Encoding::Gsm7);
        assert_eq!(Encoding::from_data_coding(0xF4), Encoding::Binary);
        assert_eq!(Encoding::Ucs2.max_single_octets(), 140);
    }

    #[test]
    fn test_status_roundtrip_str() {
        for s in ["pending", "sent", "delivered", "failed", "expired", "rejected", "scheduled"] {
            assert_eq!(s.parse::<MessageStatus>().unwrap().as_str(), s);
        }
        assert!("queued".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_transport_binding_serde() {
        let json = r#"{"kind":"sigtran","remote":"stp-a"}"#;
        let binding: TransportBinding = serde_json::from_str(json).unwrap();
        assert_eq!(
            binding,
            TransportBinding::Sigtran {
                remote: "stp-a".to_string()
            }
        );
    }
}
