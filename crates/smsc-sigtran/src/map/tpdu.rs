//! SMS transfer layer PDUs (TS 23.040)
//!
//! SMS-DELIVER travels in MT-ForwardSM, SMS-SUBMIT in MO-ForwardSM. User
//! data is kept unpacked: GSM7 bodies hold one septet per octet.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};
use smsc_core::Address;

use super::encoding::{self, CharacterSet};
use crate::errors::{EncodingError, MapError};

const MTI_DELIVER: u8 = 0x00;
const MTI_SUBMIT: u8 = 0x01;

const TON_ALPHANUMERIC: u8 = 5;

/// Largest user data length in septets (GSM7) or octets
pub const MAX_SEPTETS: usize = 160;
pub const MAX_OCTETS: usize = 140;

/// TP user data, split into the optional header and the body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserData {
    /// Complete UDH including the UDHL octet
    pub header: Option<Bytes>,
    pub body: Vec<u8>,
}

impl UserData {
    pub fn new(body: Vec<u8>) -> Self {
        Self { header: None, body }
    }

    /// Split SMPP-style content whose first octet is a UDH length
    pub fn with_header(content: &[u8]) -> Result<Self, MapError> {
        let udhl = *content
            .first()
            .ok_or_else(|| MapError::Malformed("empty UDH".to_string()))? as usize;
        if content.len() < udhl + 1 {
            return Err(MapError::Malformed("UDH longer than content".to_string()));
        }
        Ok(Self {
            header: Some(Bytes::copy_from_slice(&content[..=udhl])),
            body: content[udhl + 1..].to_vec(),
        })
    }

    /// Header and body joined back into one buffer
    pub fn to_content(&self) -> Vec<u8> {
        let mut content = self.header.as_ref().map(|h| h.to_vec()).unwrap_or_default();
        content.extend_from_slice(&self.body);
        content
    }

    fn encode(&self, charset: CharacterSet, buf: &mut BytesMut) -> Result<(), MapError> {
        let header_len = self.header.as_ref().map(|h| h.len()).unwrap_or(0);
        match charset {
            CharacterSet::Gsm7 => {
                let header_septets = (header_len * 8 + 6) / 7;
                let fill_bits = header_septets * 7 - header_len * 8;
                let udl = header_septets + self.body.len();
                if udl > MAX_SEPTETS {
                    return Err(MapError::Malformed(format!("{} septets of user data", udl)));
                }
                buf.put_u8(udl as u8);
                if let Some(header) = &self.header {
                    buf.put_slice(header);
                }
                buf.put_slice(&encoding::pack_septets(&self.body, fill_bits));
            }
            CharacterSet::EightBit | CharacterSet::Ucs2 => {
                let udl = header_len + self.body.len();
                if udl > MAX_OCTETS {
                    return Err(MapError::Malformed(format!("{} octets of user data", udl)));
                }
                buf.put_u8(udl as u8);
                if let Some(header) = &self.header {
                    buf.put_slice(header);
                }
                buf.put_slice(&self.body);
            }
        }
        Ok(())
    }

    fn decode(
        reader: &mut Reader<'_>,
        charset: CharacterSet,
        udhi: bool,
    ) -> Result<Self, MapError> {
        let udl = reader.u8()? as usize;
        match charset {
            CharacterSet::Gsm7 => {
                if udl > MAX_SEPTETS {
                    return Err(MapError::Malformed(format!("UDL {} septets", udl)));
                }
                let data = reader.take((udl * 7 + 7) / 8)?;
                let (header, header_septets, offset) = if udhi {
                    let header = split_header(data)?;
                    let septets = (header.len() * 8 + 6) / 7;
                    let len = header.len();
                    (Some(header), septets, len)
                } else {
                    (None, 0, 0)
                };
                let count = udl.checked_sub(header_septets).ok_or_else(|| {
                    MapError::Malformed("UDH longer than user data".to_string())
                })?;
                let fill_bits = header_septets * 7 - offset * 8;
                let body = encoding::unpack_septets(&data[offset..], fill_bits, count)?;
                Ok(Self { header, body })
            }
            CharacterSet::EightBit | CharacterSet::Ucs2 => {
                if udl > MAX_OCTETS {
                    return Err(MapError::Malformed(format!("UDL {} octets", udl)));
                }
                let data = reader.take(udl)?;
                if udhi {
                    Self::with_header(data)
                } else {
                    Ok(Self::new(data.to_vec()))
                }
            }
        }
    }
}

fn split_header(data: &[u8]) -> Result<Bytes, MapError> {
    let udhl = *data
        .first()
        .ok_or_else(|| MapError::Malformed("missing UDHL".to_string()))? as usize;
    if data.len() < udhl + 1 {
        return Err(MapError::Malformed("UDH overruns user data".to_string()));
    }
    Ok(Bytes::copy_from_slice(&data[..=udhl]))
}

/// TP-VP in one of its three formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityPeriod {
    Relative(u8),
    Enhanced([u8; 7]),
    Absolute([u8; 7]),
}

impl ValidityPeriod {
    /// Smallest relative period covering `secs`
    pub fn relative_from_secs(secs: u64) -> Self {
        let minutes = (secs + 59) / 60;
        let days = (secs + 86_399) / 86_400;
        let value = if minutes <= 720 {
            ((minutes + 4) / 5).saturating_sub(1)
        } else if minutes <= 1440 {
            143 + (minutes - 720 + 29) / 30
        } else if days <= 30 {
            166 + days
        } else {
            (192 + (days + 6) / 7).min(255)
        };
        Self::Relative(value as u8)
    }

    fn vpf(&self) -> u8 {
        match self {
            Self::Relative(_) => 0b10,
            Self::Enhanced(_) => 0b01,
            Self::Absolute(_) => 0b11,
        }
    }

    /// Validity in seconds measured from `now`
    pub fn as_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            Self::Relative(value) => Some(relative_secs(*value)),
            Self::Absolute(octets) => {
                let until = decode_timestamp(octets).ok()?;
                Some((until - now).num_seconds().max(0) as u64)
            }
            Self::Enhanced(octets) => match octets[0] & 0x07 {
                1 => Some(relative_secs(octets[1])),
                2 => Some(octets[1] as u64),
                3 => {
                    let h = swapped_bcd(octets[1])? as u64;
                    let m = swapped_bcd(octets[2])? as u64;
                    let s = swapped_bcd(octets[3])? as u64;
                    Some(h * 3600 + m * 60 + s)
                }
                _ => None,
            },
        }
    }
}

fn relative_secs(value: u8) -> u64 {
    let value = value as u64;
    match value {
        0..=143 => (value + 1) * 5 * 60,
        144..=167 => 12 * 3600 + (value - 143) * 30 * 60,
        168..=196 => (value - 166) * 86_400,
        _ => (value - 192) * 7 * 86_400,
    }
}

/// SMS-DELIVER, SC to MS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsDeliver {
    pub more_messages_to_send: bool,
    pub status_report_indication: bool,
    pub reply_path: bool,
    pub originating_address: Address,
    pub protocol_id: u8,
    pub dcs: u8,
    pub service_centre_timestamp: DateTime<Utc>,
    pub user_data: UserData,
}

impl SmsDeliver {
    pub fn encode(&self) -> Result<Bytes, MapError> {
        let charset = CharacterSet::from_dcs(self.dcs)?;
        let mut buf = BytesMut::with_capacity(176);

        let mut first = MTI_DELIVER;
        if !self.more_messages_to_send {
            first |= 0x04;
        }
        if self.status_report_indication {
            first |= 0x20;
        }
        if self.user_data.header.is_some() {
            first |= 0x40;
        }
        if self.reply_path {
            first |= 0x80;
        }
        buf.put_u8(first);
        encode_address(&self.originating_address, &mut buf)?;
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.dcs);
        buf.put_slice(&encode_timestamp(self.service_centre_timestamp));
        self.user_data.encode(charset, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, MapError> {
        let mut reader = Reader::new(data);
        let first = reader.u8()?;
        if first & 0x03 != MTI_DELIVER {
            return Err(MapError::Malformed(format!(
                "expected SMS-DELIVER, MTI {}",
                first & 0x03
            )));
        }
        let originating_address = decode_address(&mut reader)?;
        let protocol_id = reader.u8()?;
        let dcs = reader.u8()?;
        let mut scts = [0u8; 7];
        scts.copy_from_slice(reader.take(7)?);
        let service_centre_timestamp = decode_timestamp(&scts)?;
        let charset = CharacterSet::from_dcs(dcs)?;
        let user_data = UserData::decode(&mut reader, charset, first & 0x40 != 0)?;

        Ok(Self {
            more_messages_to_send: first & 0x04 == 0,
            status_report_indication: first & 0x20 != 0,
            reply_path: first & 0x80 != 0,
            originating_address,
            protocol_id,
            dcs,
            service_centre_timestamp,
            user_data,
        })
    }
}

/// SMS-SUBMIT, MS to SC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsSubmit {
    pub reject_duplicates: bool,
    pub status_report_request: bool,
    pub reply_path: bool,
    pub message_reference: u8,
    pub destination_address: Address,
    pub protocol_id: u8,
    pub dcs: u8,
    pub validity_period: Option<ValidityPeriod>,
    pub user_data: UserData,
}

impl SmsSubmit {
    pub fn encode(&self) -> Result<Bytes, MapError> {
        let charset = CharacterSet::from_dcs(self.dcs)?;
        let mut buf = BytesMut::with_capacity(176);

        let mut first = MTI_SUBMIT;
        if self.reject_duplicates {
            first |= 0x04;
        }
        if let Some(vp) = &self.validity_period {
            first |= vp.vpf() << 3;
        }
        if self.status_report_request {
            first |= 0x20;
        }
        if self.user_data.header.is_some() {
            first |= 0x40;
        }
        if self.reply_path {
            first |= 0x80;
        }
        buf.put_u8(first);
        buf.put_u8(self.message_reference);
        encode_address(&self.destination_address, &mut buf)?;
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.dcs);
        match &self.validity_period {
            Some(ValidityPeriod::Relative(v)) => buf.put_u8(*v),
            Some(ValidityPeriod::Enhanced(o)) | Some(ValidityPeriod::Absolute(o)) => {
                buf.put_slice(o)
            }
            None => {}
        }
        self.user_data.encode(charset, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, MapError> {
        let mut reader = Reader::new(data);
        let first = reader.u8()?;
        if first & 0x03 != MTI_SUBMIT {
            return Err(MapError::Malformed(format!(
                "expected SMS-SUBMIT, MTI {}",
                first & 0x03
            )));
        }
        let message_reference = reader.u8()?;
        let destination_address = decode_address(&mut reader)?;
        let protocol_id = reader.u8()?;
        let dcs = reader.u8()?;
        let validity_period = match (first >> 3) & 0x03 {
            0b00 => None,
            0b10 => Some(ValidityPeriod::Relative(reader.u8()?)),
            vpf => {
                let mut octets = [0u8; 7];
                octets.copy_from_slice(reader.take(7)?);
                Some(if vpf == 0b01 {
                    ValidityPeriod::Enhanced(octets)
                } else {
                    ValidityPeriod::Absolute(octets)
                })
            }
        };
        let charset = CharacterSet::from_dcs(dcs)?;
        let user_data = UserData::decode(&mut reader, charset, first & 0x40 != 0)?;

        Ok(Self {
            reject_duplicates: first & 0x04 != 0,
            status_report_request: first & 0x20 != 0,
            reply_path: first & 0x80 != 0,
            message_reference,
            destination_address,
            protocol_id,
            dcs,
            validity_period,
            user_data,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, MapError> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MapError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(EncodingError::BufferTooShort.into());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Encode digits as TBCD semi-octets, filling an odd tail with 0xF
pub fn encode_tbcd(digits: &str) -> Result<Vec<u8>, EncodingError> {
    let nibbles = digits
        .chars()
        .map(|c| match c {
            '0'..='9' => Ok(c as u8 - b'0'),
            '*' => Ok(0x0A),
            '#' => Ok(0x0B),
            'a' | 'A' => Ok(0x0C),
            'b' | 'B' => Ok(0x0D),
            'c' | 'C' => Ok(0x0E),
            _ => Err(EncodingError::InvalidBcd),
        })
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(nibbles
        .chunks(2)
        .map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0x0F) << 4))
        .collect())
}

/// Decode TBCD semi-octets; a 0xF nibble ends the digits
pub fn decode_tbcd(data: &[u8]) -> Result<String, EncodingError> {
    let mut digits = String::with_capacity(data.len() * 2);
    for (i, &byte) in data.iter().enumerate() {
        for nibble in [byte & 0x0F, byte >> 4] {
            let c = match nibble {
                0..=9 => (b'0' + nibble) as char,
                0x0A => '*',
                0x0B => '#',
                0x0C => 'a',
                0x0D => 'b',
                0x0E => 'c',
                _ if i == data.len() - 1 => return Ok(digits),
                _ => return Err(EncodingError::InvalidBcd),
            };
            digits.push(c);
        }
    }
    Ok(digits)
}

fn type_of_address(address: &Address) -> u8 {
    0x80 | ((address.ton & 0x07) << 4) | (address.npi & 0x0F)
}

fn encode_address(address: &Address, buf: &mut BytesMut) -> Result<(), MapError> {
    if address.ton == TON_ALPHANUMERIC {
        let septets = encoding::encode_gsm7(&address.digits)?;
        let packed = encoding::pack_septets(&septets, 0);
        let semi_octets = (septets.len() * 7 + 3) / 4;
        if packed.len() > 10 {
            return Err(MapError::Malformed("alphanumeric address too long".to_string()));
        }
        buf.put_u8(semi_octets as u8);
        buf.put_u8(type_of_address(address));
        buf.put_slice(&packed);
    } else {
        if address.digits.len() > 20 {
            return Err(MapError::Malformed("address longer than 20 digits".to_string()));
        }
        buf.put_u8(address.digits.len() as u8);
        buf.put_u8(type_of_address(address));
        buf.put_slice(&encode_tbcd(&address.digits)?);
    }
    Ok(())
}

fn decode_address(reader: &mut Reader<'_>) -> Result<Address, MapError> {
    let semi_octets = reader.u8()? as usize;
    let toa = reader.u8()?;
    let ton = (toa >> 4) & 0x07;
    let npi = toa & 0x0F;
    let data = reader.take((semi_octets + 1) / 2)?;
    let digits = if ton == TON_ALPHANUMERIC {
        let septets = encoding::unpack_septets(data, 0, semi_octets * 4 / 7)?;
        encoding::decode_gsm7(&septets)
    } else {
        let mut digits = decode_tbcd(data)?;
        digits.truncate(semi_octets);
        digits
    };
    Ok(Address::new(ton, npi, digits))
}

fn to_swapped_bcd(value: u32) -> u8 {
    let value = (value % 100) as u8;
    (value / 10) | ((value % 10) << 4)
}

fn swapped_bcd(octet: u8) -> Option<u32> {
    let (tens, units) = (octet & 0x0F, octet >> 4);
    if tens > 9 || units > 9 {
        return None;
    }
    Some(tens as u32 * 10 + units as u32)
}

/// TP-SCTS in UTC (time zone 0)
pub fn encode_timestamp(at: DateTime<Utc>) -> [u8; 7] {
    [
        to_swapped_bcd(at.year() as u32),
        to_swapped_bcd(at.month()),
        to_swapped_bcd(at.day()),
        to_swapped_bcd(at.hour()),
        to_swapped_bcd(at.minute()),
        to_swapped_bcd(at.second()),
        0x00,
    ]
}

pub fn decode_timestamp(octets: &[u8; 7]) -> Result<DateTime<Utc>, MapError> {
    let field = |i: usize| {
        swapped_bcd(octets[i]).ok_or_else(|| MapError::Malformed("bad timestamp digit".to_string()))
    };
    let tz = octets[6];
    let quarters = swapped_bcd(tz & 0xF7)
        .ok_or_else(|| MapError::Malformed("bad time zone".to_string()))? as i32;
    let offset_secs = (if tz & 0x08 != 0 { -quarters } else { quarters }) * 15 * 60;
    let offset = FixedOffset::east_opt(offset_secs)
        .ok_or_else(|| MapError::Malformed("time zone out of range".to_string()))?;

    let local = offset
        .with_ymd_and_hms(
            2000 + field(0)? as i32,
            field(1)?,
            field(2)?,
            field(3)?,
            field(4)?,
            field(5)?,
        )
        .single()
        .ok_or_else(|| MapError::Malformed("invalid timestamp".to_string()))?;
    Ok(local.with_timezone(&Utc))
}

/// Validity carried as a relative TP-VP, defaulting when absent
pub fn validity_secs(vp: Option<&ValidityPeriod>, now: DateTime<Utc>, default: u64) -> u64 {
    vp.and_then(|vp| vp.as_secs(now)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap()
    }

    #[test]
    fn test_tbcd() {
        assert_eq!(encode_tbcd("12345").unwrap(), vec![0x21, 0x43, 0xF5]);
        assert_eq!(decode_tbcd(&[0x21, 0x43, 0xF5]).unwrap(), "12345");
        assert_eq!(decode_tbcd(&[0x21, 0x43]).unwrap(), "1234");
        assert!(encode_tbcd("12x").is_err());
        assert!(decode_tbcd(&[0xF1, 0x21]).is_err());
    }

    #[test]
    fn test_deliver_roundtrip_gsm7() {
        let deliver = SmsDeliver {
            more_messages_to_send: false,
            status_report_indication: true,
            reply_path: false,
            originating_address: Address::international("15550001"),
            protocol_id: 0,
            dcs: 0x00,
            service_centre_timestamp: at(),
            user_data: UserData::new(encoding::encode_gsm7("hellohello").unwrap()),
        };
        let encoded = deliver.encode().unwrap();
        // MTI 0, no more messages, status report indication
        assert_eq!(encoded[0], 0x24);
        // 8 digits, international ISDN
        assert_eq!(&encoded[1..3], &[0x08, 0x91]);
        assert_eq!(&encoded[3..7], &[0x51, 0x55, 0x00, 0x10]);
        // SCTS
        assert_eq!(&encoded[9..16], &[0x42, 0x30, 0x51, 0x01, 0x03, 0x54, 0x00]);
        assert_eq!(encoded[16], 10);
        assert_eq!(&encoded[17..], &[0xE8, 0x32, 0x9B, 0xFD, 0x46, 0x97, 0xD9, 0xEC, 0x37]);

        assert_eq!(SmsDeliver::decode(&encoded).unwrap(), deliver);
    }

    #[test]
    fn test_deliver_with_udh_gsm7() {
        let header = Bytes::from_static(&[0x05, 0x00, 0x03, 0x2A, 0x02, 0x01]);
        let deliver = SmsDeliver {
            more_messages_to_send: true,
            status_report_indication: false,
            reply_path: false,
            originating_address: Address::new(5, 0, "Bank"),
            protocol_id: 0,
            dcs: 0x00,
            service_centre_timestamp: at(),
            user_data: UserData {
                header: Some(header),
                body: encoding::encode_gsm7("part one").unwrap(),
            },
        };
        let encoded = deliver.encode().unwrap();
        assert_eq!(encoded[0] & 0x40, 0x40);
        let decoded = SmsDeliver::decode(&encoded).unwrap();
        assert_eq!(decoded.originating_address.digits, "Bank");
        assert_eq!(decoded, deliver);
    }

    #[test]
    fn test_submit_roundtrip_ucs2_with_vp() {
        let submit = SmsSubmit {
            reject_duplicates: false,
            status_report_request: true,
            reply_path: false,
            message_reference: 7,
            destination_address: Address::international("4479001"),
            protocol_id: 0,
            dcs: 0x08,
            validity_period: Some(ValidityPeriod::Relative(167)),
            user_data: UserData::new(encoding::encode_ucs2("héllo 世界")),
        };
        let encoded = submit.encode().unwrap();
        // MTI 1, VPF relative, SRR
        assert_eq!(encoded[0], 0x01 | 0x10 | 0x20);
        let decoded = SmsSubmit::decode(&encoded).unwrap();
        assert_eq!(decoded, submit);
        assert_eq!(decoded.destination_address.digits, "4479001");
        assert_eq!(
            decoded.validity_period.unwrap().as_secs(at()),
            Some(24 * 3600)
        );
    }

    #[test]
    fn test_wrong_mti_rejected() {
        let submit = SmsSubmit {
            reject_duplicates: false,
            status_report_request: false,
            reply_path: false,
            message_reference: 0,
            destination_address: Address::international("1"),
            protocol_id: 0,
            dcs: 0x04,
            validity_period: None,
            user_data: UserData::new(vec![1, 2, 3]),
        };
        let encoded = submit.encode().unwrap();
        assert!(SmsDeliver::decode(&encoded).is_err());
        assert!(SmsSubmit::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_relative_validity() {
        assert_eq!(relative_secs(0), 300);
        assert_eq!(relative_secs(143), 12 * 3600);
        assert_eq!(relative_secs(167), 24 * 3600);
        assert_eq!(relative_secs(168), 2 * 86_400);
        assert_eq!(relative_secs(197), 5 * 7 * 86_400);

        for secs in [60, 3600, 12 * 3600, 18 * 3600, 3 * 86_400, 60 * 86_400] {
            let ValidityPeriod::Relative(v) = ValidityPeriod::relative_from_secs(secs) else {
                panic!("relative expected");
            };
            assert!(relative_secs(v) >= secs, "{} -> {}", secs, v);
        }
    }

    #[test]
    fn test_timestamp_with_zone() {
        // +4 quarters = UTC+1
        let mut octets = encode_timestamp(at());
        octets[6] = 0x40;
        let decoded = decode_timestamp(&octets).unwrap();
        assert_eq!(decoded, at() - chrono::Duration::hours(1));
    }

    #[test]
    fn test_user_data_too_long() {
        let ud = UserData::new(vec![0x41; 161]);
        let mut buf = BytesMut::new();
        assert!(ud.encode(CharacterSet::Gsm7, &mut buf).is_err());
    }
}
