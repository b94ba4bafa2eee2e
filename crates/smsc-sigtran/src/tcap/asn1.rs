//! ASN.1 BER Encoding/Decoding utilities
//!
//! Definite lengths and single-octet tags only, which covers TCAP and the
//! MAP SMS arguments.

use bytes::{BufMut, BytesMut};

use crate::errors::TcapError;

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const EXTERNAL: u8 = 0x28;
    pub const SEQUENCE: u8 = 0x30;
}

/// Encode a tagged value (TLV)
pub fn encode_tagged(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    encode_length(buf, value.len());
    buf.put_slice(value);
}

/// Encode length in BER definite form
pub fn encode_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 256 {
        buf.put_u8(0x81);
        buf.put_u8(len as u8);
    } else if len < 65536 {
        buf.put_u8(0x82);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0x84);
        buf.put_u32(len as u32);
    }
}

pub fn encode_integer(buf: &mut BytesMut, tag: u8, value: i32) {
    encode_tagged(buf, tag, &integer_to_bytes(value));
}

/// Minimal two's complement representation
fn integer_to_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Decode a two's complement integer of at most four octets
pub fn parse_integer(data: &[u8]) -> Result<i32, TcapError> {
    if data.is_empty() || data.len() > 4 {
        return Err(TcapError::Asn1Error(format!(
            "integer of {} octets",
            data.len()
        )));
    }
    let mut result: i32 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in data {
        result = (result << 8) | byte as i32;
    }
    Ok(result)
}

/// One decoded TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    pub fn integer(&self) -> Result<i32, TcapError> {
        parse_integer(self.value)
    }

    pub fn expect(self, tag: u8) -> Result<Self, TcapError> {
        if self.tag != tag {
            return Err(TcapError::UnexpectedTag(self.tag));
        }
        Ok(self)
    }
}

/// Decode BER length; returns (length, octets consumed)
pub fn decode_length(data: &[u8]) -> Result<(usize, usize), TcapError> {
    let first = *data
        .first()
        .ok_or_else(|| TcapError::Asn1Error("missing length".to_string()))?;

    if first < 0x80 {
        return Ok((first as usize, 1));
    }
    let num_bytes = (first & 0x7F) as usize;
    if num_bytes == 0 {
        return Err(TcapError::Asn1Error("indefinite length not supported".to_string()));
    }
    if num_bytes > 4 || data.len() < 1 + num_bytes {
        return Err(TcapError::Asn1Error("bad long-form length".to_string()));
    }
    let length = data[1..=num_bytes]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok((length, 1 + num_bytes))
}

/// Read one TLV from the front of `data`, returning it and the rest
pub fn read_tlv(data: &[u8]) -> Result<(Tlv<'_>, &[u8]), TcapError> {
    let tag = *data
        .first()
        .ok_or_else(|| TcapError::Asn1Error("unexpected end of data".to_string()))?;
    if tag & 0x1F == 0x1F {
        return Err(TcapError::Asn1Error("multi-octet tags not supported".to_string()));
    }
    let (length, header_len) = decode_length(&data[1..])?;
    let start = 1 + header_len;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| TcapError::Asn1Error(format!("tag 0x{:02X} overruns data", tag)))?;
    Ok((
        Tlv {
            tag,
            value: &data[start..end],
        },
        &data[end..],
    ))
}

/// Iterate over consecutive TLVs
pub struct TlvIter<'a> {
    rest: &'a [u8],
}

pub fn iter(data: &[u8]) -> TlvIter<'_> {
    TlvIter { rest: data }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<Tlv<'a>, TcapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match read_tlv(self.rest) {
            Ok((tlv, rest)) => {
                self.rest = rest;
                Some(Ok(tlv))
            }
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

/// Encode an OID including its tag
pub fn encode_oid(oid: &[u32]) -> Vec<u8> {
    let mut content = Vec::new();
    if oid.len() >= 2 {
        encode_oid_component(&mut content, oid[0] * 40 + oid[1]);
        for &component in &oid[2..] {
            encode_oid_component(&mut content, component);
        }
    }
    let mut result = Vec::with_capacity(content.len() + 2);
    result.push(tag::OID);
    result.push(content.len() as u8);
    result.extend(content);
    result
}

fn encode_oid_component(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = vec![(value & 0x7F) as u8];
    let mut v = value >> 7;
    while v > 0 {
        bytes.push(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
    bytes.reverse();
    buf.extend(bytes);
}

/// Decode OID content octets
pub fn decode_oid(data: &[u8]) -> Result<Vec<u32>, TcapError> {
    let mut components = Vec::new();
    let mut value = 0u32;
    let mut pending = false;
    for &byte in data {
        value = (value << 7) | (byte & 0x7F) as u32;
        pending = true;
        if byte & 0x80 == 0 {
            components.push(value);
            value = 0;
            pending = false;
        }
    }
    if pending || components.is_empty() {
        return Err(TcapError::Asn1Error("truncated OID".to_string()));
    }

    let first = components[0];
    let (a, b) = if first < 80 {
        (first / 40, first % 40)
    } else {
        (2, first - 80)
    };
    let mut oid = vec![a, b];
    oid.extend_from_slice(&components[1..]);
    Ok(oid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_encoding() {
        let mut buf = BytesMut::new();
        encode_length(&mut buf, 10);
        assert_eq!(&buf[..], &[10]);

        buf.clear();
        encode_length(&mut buf, 200);
        assert_eq!(&buf[..], &[0x81, 200]);

        buf.clear();
        encode_length(&mut buf, 1000);
        assert_eq!(&buf[..], &[0x82, 0x03, 0xE8]);
        assert_eq!(decode_length(&buf).unwrap(), (1000, 3));
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = BytesMut::new();
        encode_integer(&mut buf, tag::INTEGER, 5);
        assert_eq!(&buf[..], &[0x02, 0x01, 0x05]);

        for value in [0, 1, 127, 128, 255, 256, -1, -128, -129, 44, i32::MAX, i32::MIN] {
            let bytes = integer_to_bytes(value);
            assert_eq!(parse_integer(&bytes).unwrap(), value, "value {}", value);
        }
        assert_eq!(integer_to_bytes(128), vec![0x00, 0x80]);
        assert_eq!(integer_to_bytes(-128), vec![0x80]);
    }

    #[test]
    fn test_oid_roundtrip() {
        // shortMsgMT-RelayContext-v3
        let oid = [0, 4, 0, 0, 1, 0, 25, 3];
        let encoded = encode_oid(&oid);
        assert_eq!(encoded[0], tag::OID);
        assert_eq!(decode_oid(&encoded[2..]).unwrap(), oid.to_vec());

        let dialogue_as = [0, 0, 17, 773, 1, 1, 1];
        let encoded = encode_oid(&dialogue_as);
        assert_eq!(&encoded[2..], &[0x00, 0x11, 0x86, 0x05, 0x01, 0x01, 0x01]);
        assert_eq!(decode_oid(&encoded[2..]).unwrap(), dialogue_as.to_vec());
    }

    #[test]
    fn test_tlv_iteration() {
        let data = [0x02, 0x01, 0x07, 0x04, 0x02, 0xAA, 0xBB];
        let tlvs: Vec<_> = iter(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].integer().unwrap(), 7);
        assert_eq!(tlvs[1].value, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_overrun_rejected() {
        assert!(read_tlv(&[0x04, 0x05, 0x01]).is_err());
        assert!(read_tlv(&[0x30, 0x80]).is_err());
    }
}
