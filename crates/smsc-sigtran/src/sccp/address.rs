//! SCCP party addresses and global titles

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::SccpError;

/// Called or calling party address (Q.713 §3.4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SccpAddress {
    pub address_indicator: AddressIndicator,
    pub global_title: Option<GlobalTitle>,
    pub point_code: Option<u32>,
    pub subsystem_number: Option<u8>,
}

/// First octet of a party address, ITU layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressIndicator {
    /// Bit 7 clear: the GT, not the PC+SSN, decides routing
    pub route_on_gt: bool,
    pub gti: u8,
    pub ssn_indicator: bool,
    pub pc_indicator: bool,
}

const AI_ROUTE_ON_SSN: u8 = 0x40;
const AI_SSN_PRESENT: u8 = 0x02;
const AI_PC_PRESENT: u8 = 0x01;

impl AddressIndicator {
    pub fn encode(&self) -> u8 {
        let flag = |set: bool, bit: u8| if set { bit } else { 0 };
        flag(!self.route_on_gt, AI_ROUTE_ON_SSN)
            | (self.gti & 0x0F) << 2
            | flag(self.ssn_indicator, AI_SSN_PRESENT)
            | flag(self.pc_indicator, AI_PC_PRESENT)
    }

    pub fn decode(octet: u8) -> Self {
        Self {
            route_on_gt: octet & AI_ROUTE_ON_SSN == 0,
            gti: (octet >> 2) & 0x0F,
            ssn_indicator: octet & AI_SSN_PRESENT != 0,
            pc_indicator: octet & AI_PC_PRESENT != 0,
        }
    }
}

/// Global title, one variant per GT indicator value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalTitle {
    /// Nature of address, odd/even in its top bit
    Gt0001 {
        nature_of_address: u8,
        digits: String,
    },
    Gt0010 { translation_type: u8, digits: String },
    Gt0011 {
        translation_type: u8,
        numbering_plan: u8,
        digits: String,
    },
    /// TT, NP/ES and NAI; what MAP peers send in practice
    Gt0100 {
        translation_type: u8,
        numbering_plan: u8,
        nature_of_address: u8,
        digits: String,
    },
}

impl GlobalTitle {
    /// International E.164 number, NP 1 and NAI 4
    pub fn e164(digits: &str, translation_type: u8) -> Self {
        Self::Gt0100 {
            translation_type,
            numbering_plan: 1,
            nature_of_address: 4,
            digits: digits.to_string(),
        }
    }

    pub fn gti(&self) -> u8 {
        match self {
            Self::Gt0001 { .. } => 1,
            Self::Gt0010 { .. } => 2,
            Self::Gt0011 { .. } => 3,
            Self::Gt0100 { .. } => 4,
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            Self::Gt0001 { digits, .. }
            | Self::Gt0010 { digits, .. }
            | Self::Gt0011 { digits, .. }
            | Self::Gt0100 { digits, .. } => digits,
        }
    }

    /// BCD encoding scheme: 1 odd digit count, 2 even
    fn encoding_scheme(&self) -> u8 {
        if self.digits().len() % 2 == 0 {
            2
        } else {
            1
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), SccpError> {
        let bcd = encode_bcd_digits(self.digits())?;
        let odd = if self.encoding_scheme() == 1 { 0x80 } else { 0 };

        match self {
            Self::Gt0001 {
                nature_of_address, ..
            } => {
                buf.put_u8((*nature_of_address & 0x7F) | odd);
            }
            Self::Gt0010 {
                translation_type, ..
            } => {
                buf.put_u8(*translation_type);
            }
            Self::Gt0011 {
                translation_type,
                numbering_plan,
                ..
            } => {
                buf.put_u8(*translation_type);
                buf.put_u8(self.encoding_scheme() | ((*numbering_plan & 0x0F) << 4));
            }
            Self::Gt0100 {
                translation_type,
                numbering_plan,
                nature_of_address,
                ..
            } => {
                buf.put_u8(*translation_type);
                buf.put_u8(self.encoding_scheme() | ((*numbering_plan & 0x0F) << 4));
                buf.put_u8(*nature_of_address & 0x7F);
            }
        }
        buf.put_slice(&bcd);
        Ok(())
    }

    pub fn decode(gti: u8, mut data: Bytes) -> Result<Self, SccpError> {
        let need = match gti {
            1 | 2 => 1,
            3 => 2,
            4 => 3,
            _ => {
                return Err(SccpError::AddressError(format!(
                    "unsupported GTI {}",
                    gti
                )))
            }
        };
        if data.remaining() < need {
            return Err(SccpError::AddressError("global title too short".to_string()));
        }

        Ok(match gti {
            1 => {
                let noa = data.get_u8();
                Self::Gt0001 {
                    nature_of_address: noa & 0x7F,
                    digits: decode_bcd_digits(&data, noa & 0x80 != 0),
                }
            }
            2 => Self::Gt0010 {
                translation_type: data.get_u8(),
                digits: decode_bcd_digits(&data, false),
            },
            3 => {
                let tt = data.get_u8();
                let np_es = data.get_u8();
                Self::Gt0011 {
                    translation_type: tt,
                    numbering_plan: (np_es >> 4) & 0x0F,
                    digits: decode_bcd_digits(&data, np_es & 0x0F == 1),
                }
            }
            _ => {
                let tt = data.get_u8();
                let np_es = data.get_u8();
                let noa = data.get_u8();
                Self::Gt0100 {
                    translation_type: tt,
                    numbering_plan: (np_es >> 4) & 0x0F,
                    nature_of_address: noa & 0x7F,
                    digits: decode_bcd_digits(&data, np_es & 0x0F == 1),
                }
            }
        })
    }
}

impl SccpAddress {
    /// Address routed on SSN with a point code
    pub fn from_ssn_pc(ssn: u8, pc: u32) -> Self {
        Self {
            address_indicator: AddressIndicator {
                route_on_gt: false,
                gti: 0,
                ssn_indicator: true,
                pc_indicator: true,
            },
            global_title: None,
            point_code: Some(pc),
            subsystem_number: Some(ssn),
        }
    }

    /// Address routed on global title
    pub fn from_gt(gt: GlobalTitle, ssn: Option<u8>) -> Self {
        Self {
            address_indicator: AddressIndicator {
                route_on_gt: true,
                gti: gt.gti(),
                ssn_indicator: ssn.is_some(),
                pc_indicator: false,
            },
            global_title: Some(gt),
            point_code: None,
            subsystem_number: ssn,
        }
    }

    pub fn encode(&self) -> Result<Bytes, SccpError> {
        let mut buf = BytesMut::with_capacity(16);
        let mut ai = self.address_indicator;
        ai.pc_indicator = self.point_code.is_some();
        ai.ssn_indicator = self.subsystem_number.is_some();
        ai.gti = self.global_title.as_ref().map(GlobalTitle::gti).unwrap_or(0);
        buf.put_u8(ai.encode());

        if let Some(pc) = self.point_code {
            if pc > 0x3FFF {
                return Err(SccpError::AddressError(format!(
                    "point code {} exceeds 14 bits",
                    pc
                )));
            }
            buf.put_u16_le(pc as u16);
        }
        if let Some(ssn) = self.subsystem_number {
            buf.put_u8(ssn);
        }
        if let Some(gt) = &self.global_title {
            gt.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> Result<Self, SccpError> {
        if data.remaining() < 1 {
            return Err(SccpError::AddressError("empty address".to_string()));
        }

        let ai = AddressIndicator::decode(data.get_u8());

        let point_code = if ai.pc_indicator {
            if data.remaining() < 2 {
                return Err(SccpError::AddressError("missing point code".to_string()));
            }
            Some((data.get_u16_le() & 0x3FFF) as u32)
        } else {
            None
        };

        let subsystem_number = if ai.ssn_indicator {
            if data.remaining() < 1 {
                return Err(SccpError::AddressError("missing SSN".to_string()));
            }
            Some(data.get_u8())
        } else {
            None
        };

        let global_title = if ai.gti > 0 {
            Some(GlobalTitle::decode(ai.gti, data)?)
        } else {
            None
        };

        Ok(Self {
            address_indicator: ai,
            global_title,
            point_code,
            subsystem_number,
        })
    }

    /// Digits of the global title, if any
    pub fn digits(&self) -> Option<&str> {
        self.global_title.as_ref().map(GlobalTitle::digits)
    }
}

fn encode_bcd_digits(digits: &str) -> Result<Vec<u8>, SccpError> {
    let nibbles = digits
        .chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as u8)
                .ok_or_else(|| SccpError::AddressError(format!("invalid digit {:?}", c)))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    Ok(nibbles
        .chunks(2)
        .map(|pair| match pair {
            [low, high] => low | (high << 4),
            [low] => *low,
            _ => 0,
        })
        .collect())
}

fn decode_bcd_digits(data: &[u8], odd: bool) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for (i, &byte) in data.iter().enumerate() {
        let low = byte & 0x0F;
        let high = byte >> 4;
        if low < 10 {
            result.push(char::from(b'0' + low));
        }
        let last = i + 1 == data.len();
        if high < 10 && !(last && odd) {
            result.push(char::from(b'0' + high));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gt_address_roundtrip() {
        let addr = SccpAddress::from_gt(GlobalTitle::e164("447700900123", 0), Some(8));
        let decoded = SccpAddress::decode(addr.encode().unwrap()).unwrap();
        assert_eq!(decoded, addr);

        let odd = SccpAddress::from_gt(GlobalTitle::e164("4477009001230", 0), Some(6));
        let decoded = SccpAddress::decode(odd.encode().unwrap()).unwrap();
        assert_eq!(decoded.digits(), Some("4477009001230"));
    }

    #[test]
    fn test_pc_ssn_address() {
        let addr = SccpAddress::from_ssn_pc(8, 1001);
        let encoded = addr.encode().unwrap();
        assert_eq!(&encoded[..], &[0x43, 0xE9, 0x03, 0x08]);
        assert_eq!(SccpAddress::decode(encoded).unwrap(), addr);
    }

    #[test]
    fn test_invalid_digits_rejected() {
        let addr = SccpAddress::from_gt(GlobalTitle::e164("12a4", 0), None);
        assert!(addr.encode().is_err());
    }

    #[test]
    fn test_truncated_address() {
        assert!(SccpAddress::decode(Bytes::from_static(&[0x43, 0xE9])).is_err());
    }
}
