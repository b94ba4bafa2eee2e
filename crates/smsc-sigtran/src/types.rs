//! Values shared between layers

use serde::{Deserialize, Serialize};
use smsc_core::Address;

/// How an AS distributes traffic over its ASPs (RFC 4666 §3.8.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum TrafficModeType {
    Override = 1,
    Loadshare = 2,
    Broadcast = 3,
}

impl TrafficModeType {
    pub fn from_u32(value: u32) -> Option<Self> {
        [Self::Override, Self::Loadshare, Self::Broadcast]
            .into_iter()
            .find(|mode| *mode as u32 == value)
    }
}

/// SCCP protocol class octet: class in the low nibble, "return message on
/// error" in bit 8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolClass {
    pub class: u8,
    pub return_on_error: bool,
}

impl ProtocolClass {
    const RETURN_ON_ERROR: u8 = 0x80;

    /// Basic connectionless
    pub const CLASS_0: Self = Self::new(0);
    /// In-sequence connectionless
    pub const CLASS_1: Self = Self::new(1);
    /// Basic connection-oriented
    pub const CLASS_2: Self = Self::new(2);

    const fn new(class: u8) -> Self {
        Self {
            class,
            return_on_error: false,
        }
    }

    pub fn with_return_on_error(self) -> Self {
        Self {
            return_on_error: true,
            ..self
        }
    }

    pub fn encode(&self) -> u8 {
        let flag = if self.return_on_error {
            Self::RETURN_ON_ERROR
        } else {
            0
        };
        (self.class & 0x0F) | flag
    }

    pub fn decode(octet: u8) -> Self {
        Self {
            class: octet & 0x0F,
            return_on_error: octet & Self::RETURN_ON_ERROR != 0,
        }
    }
}

/// Who the short message is for, as MAP addresses it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmRpDa {
    /// MT delivery: the recipient's subscription
    Imsi(String),
    Lmsi(Vec<u8>),
    /// MO submission: this SMSC
    ServiceCentreAddress(Address),
    NoSmRpDa,
}

/// Who the short message is from, as MAP addresses it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmRpOa {
    /// MO submission: the sending handset
    Msisdn(Address),
    /// MT delivery: the SMSC that relays it
    ServiceCentreAddress(Address),
    NoSmRpOa,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_class_octet() {
        assert_eq!(ProtocolClass::CLASS_1.with_return_on_error().encode(), 0x81);
        assert_eq!(ProtocolClass::decode(0x80), ProtocolClass::CLASS_0.with_return_on_error());
        assert_eq!(ProtocolClass::decode(0x02), ProtocolClass::CLASS_2);
    }

    #[test]
    fn test_traffic_mode_values() {
        assert_eq!(TrafficModeType::from_u32(2), Some(TrafficModeType::Loadshare));
        assert_eq!(TrafficModeType::from_u32(4), None);
    }
}
