//! GSM 7-bit and UCS2 Encoding
//!
//! GSM text is handled in two steps: characters map to septet codes
//! (`encode_gsm7`/`decode_gsm7`), and septets are packed into octets for the
//! TPDU (`pack_septets`/`unpack_septets`).

use crate::errors::EncodingError;

const ESC: u8 = 0x1B;

/// GSM 7-bit default alphabet
const GSM7_BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\x1b', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

/// GSM 7-bit extension table (after ESC)
const GSM7_EXTENSION: &[(u8, char)] = &[
    (0x0A, '\x0C'),
    (0x14, '^'),
    (0x28, '{'),
    (0x29, '}'),
    (0x2F, '\\'),
    (0x3C, '['),
    (0x3D, '~'),
    (0x3E, ']'),
    (0x40, '|'),
    (0x65, '€'),
];

/// Alphabet selected by a TP-DCS octet (TS 23.038)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Gsm7,
    EightBit,
    Ucs2,
}

impl CharacterSet {
    pub fn from_dcs(dcs: u8) -> Result<Self, EncodingError> {
        match dcs >> 4 {
            // General data coding, with or without the automatic deletion group
            0x0..=0x7 => {
                if dcs & 0x20 != 0 {
                    // compressed text
                    return Err(EncodingError::UnsupportedDcs(dcs));
                }
                match (dcs >> 2) & 0x03 {
                    0 => Ok(Self::Gsm7),
                    1 => Ok(Self::EightBit),
                    2 => Ok(Self::Ucs2),
                    _ => Err(EncodingError::UnsupportedDcs(dcs)),
                }
            }
            // Message waiting indication groups
            0xC | 0xD => Ok(Self::Gsm7),
            0xE => Ok(Self::Ucs2),
            0xF => {
                if dcs & 0x04 != 0 {
                    Ok(Self::EightBit)
                } else {
                    Ok(Self::Gsm7)
                }
            }
            _ => Err(EncodingError::UnsupportedDcs(dcs)),
        }
    }
}

/// Map an SMPP `data_coding` to the TP-DCS used on the air interface
pub fn dcs_from_data_coding(data_coding: u8) -> u8 {
    match data_coding {
        0x00 | 0x01 | 0x03 => 0x00,
        0x08 => 0x08,
        dc if dc & 0xF0 == 0xF0 => dc,
        _ => 0x04,
    }
}

/// Map a TP-DCS back to the SMPP `data_coding` for the decoded content
pub fn data_coding_from_dcs(dcs: u8) -> Result<u8, EncodingError> {
    if dcs & 0xF0 == 0xF0 {
        return Ok(dcs);
    }
    Ok(match CharacterSet::from_dcs(dcs)? {
        CharacterSet::Gsm7 => 0x00,
        CharacterSet::EightBit => 0x04,
        CharacterSet::Ucs2 => 0x08,
    })
}

/// Text to unpacked septet codes
pub fn encode_gsm7(text: &str) -> Result<Vec<u8>, EncodingError> {
    let mut septets = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if let Some(pos) = GSM7_BASIC.iter().position(|&c| c == ch) {
            septets.push(pos as u8);
        } else if let Some(&(code, _)) = GSM7_EXTENSION.iter().find(|&&(_, c)| c == ch) {
            septets.push(ESC);
            septets.push(code);
        } else {
            return Err(EncodingError::InvalidGsm7Char(ch));
        }
    }
    Ok(septets)
}

/// Unpacked septet codes to text; unknown escapes fall back to the basic table
pub fn decode_gsm7(septets: &[u8]) -> String {
    let mut result = String::with_capacity(septets.len());
    let mut escape = false;
    for &septet in septets {
        let septet = septet & 0x7F;
        if escape {
            escape = false;
            match GSM7_EXTENSION.iter().find(|&&(c, _)| c == septet) {
                Some(&(_, ch)) => result.push(ch),
                None => result.push(GSM7_BASIC[septet as usize]),
            }
        } else if septet == ESC {
            escape = true;
        } else {
            result.push(GSM7_BASIC[septet as usize]);
        }
    }
    result
}

/// Pack septets LSB first, after `fill_bits` zero bits
pub fn pack_septets(septets: &[u8], fill_bits: usize) -> Vec<u8> {
    let total_bits = fill_bits + septets.len() * 7;
    let mut out = vec![0u8; (total_bits + 7) / 8];
    for (i, &septet) in septets.iter().enumerate() {
        let bit = fill_bits + i * 7;
        let (byte, shift) = (bit / 8, bit % 8);
        let value = ((septet & 0x7F) as u16) << shift;
        out[byte] |= value as u8;
        if shift > 1 {
            out[byte + 1] |= (value >> 8) as u8;
        }
    }
    out
}

/// Unpack `count` septets starting `fill_bits` into `data`
pub fn unpack_septets(data: &[u8], fill_bits: usize, count: usize) -> Result<Vec<u8>, EncodingError> {
    let needed = (fill_bits + count * 7 + 7) / 8;
    if data.len() < needed {
        return Err(EncodingError::BufferTooShort);
    }
    let mut septets = Vec::with_capacity(count);
    for i in 0..count {
        let bit = fill_bits + i * 7;
        let (byte, shift) = (bit / 8, bit % 8);
        let low = data[byte] as u16;
        let high = data.get(byte + 1).copied().unwrap_or(0) as u16;
        septets.push((((high << 8) | low) >> shift) as u8 & 0x7F);
    }
    Ok(septets)
}

/// Encode to UCS2 (UTF-16BE, surrogate pairs above the BMP)
pub fn encode_ucs2(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

/// Decode from UCS2
pub fn decode_ucs2(data: &[u8]) -> Result<String, EncodingError> {
    if data.len() % 2 != 0 {
        return Err(EncodingError::BufferTooShort);
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsm7_encode_decode() {
        let text = "Hello World! {€}";
        let septets = encode_gsm7(text).unwrap();
        assert_eq!(septets.len(), text.chars().count() + 3);
        assert_eq!(decode_gsm7(&septets), text);
        assert!(matches!(
            encode_gsm7("日本"),
            Err(EncodingError::InvalidGsm7Char('日'))
        ));
    }

    #[test]
    fn test_pack_known_vector() {
        // "hellohello" from TS 23.040 examples
        let septets = encode_gsm7("hellohello").unwrap();
        let packed = pack_septets(&septets, 0);
        assert_eq!(packed, vec![0xE8, 0x32, 0x9B, 0xFD, 0x46, 0x97, 0xD9, 0xEC, 0x37]);
        assert_eq!(unpack_septets(&packed, 0, 10).unwrap(), septets);
    }

    #[test]
    fn test_pack_with_fill_bits() {
        let septets = encode_gsm7("abc").unwrap();
        let packed = pack_septets(&septets, 1);
        assert_eq!(unpack_septets(&packed, 1, 3).unwrap(), septets);
        assert!(unpack_septets(&packed, 1, 9).is_err());
    }

    #[test]
    fn test_ucs2_encode_decode() {
        let text = "Hello 世界! 😀";
        let encoded = encode_ucs2(text);
        assert_eq!(&encoded[..2], &[0x00, 0x48]);
        assert_eq!(decode_ucs2(&encoded).unwrap(), text);
        assert!(decode_ucs2(&[0x00]).is_err());
    }

    #[test]
    fn test_character_set_from_dcs() {
        assert_eq!(CharacterSet::from_dcs(0x00).unwrap(), CharacterSet::Gsm7);
        assert_eq!(CharacterSet::from_dcs(0x04).unwrap(), CharacterSet::EightBit);
        assert_eq!(CharacterSet::from_dcs(0x08).unwrap(), CharacterSet::Ucs2);
        assert_eq!(CharacterSet::from_dcs(0xF6).unwrap(), CharacterSet::EightBit);
        assert_eq!(CharacterSet::from_dcs(0xF0).unwrap(), CharacterSet::Gsm7);
        assert!(CharacterSet::from_dcs(0x20).is_err());
    }

    #[test]
    fn test_data_coding_mapping() {
        assert_eq!(dcs_from_data_coding(0x03), 0x00);
        assert_eq!(dcs_from_data_coding(0x08), 0x08);
        assert_eq!(dcs_from_data_coding(0x02), 0x04);
        assert_eq!(data_coding_from_dcs(0x08).unwrap(), 0x08);
        assert_eq!(data_coding_from_dcs(0x00).unwrap(), 0x00);
    }
}
