//! Canonical CBOR subset used for macaroon signing and serialization.
//!
//! Only unsigned integers (≤32 bits), byte strings, text strings and array
//! headers exist in this profile. Maps, negative integers, floats, tags and
//! indefinite lengths are rejected on decode to preserve canonicalization.

use crate::error::AuthError;

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;

pub fn encode_uint(value: u32, out: &mut Vec<u8>) {
    encode_header(MAJOR_UINT, value, out);
}

pub fn encode_byte_str(bytes: &[u8], out: &mut Vec<u8>) {
    encode_header(MAJOR_BYTES, bytes.len() as u32, out);
    out.extend_from_slice(bytes);
}

pub fn encode_text_str(text: &str, out: &mut Vec<u8>) {
    encode_header(MAJOR_TEXT, text.len() as u32, out);
    out.extend_from_slice(text.as_bytes());
}

pub fn encode_array_header(len: u32, out: &mut Vec<u8>) {
    encode_header(MAJOR_ARRAY, len, out);
}

pub fn decode_uint(input: &[u8]) -> Result<(u32, usize), AuthError> {
    let (major, value, consumed) = decode_header(input)?;
    if major != MAJOR_UINT {
        return Err(AuthError::UnsupportedItem);
    }
    Ok((value, consumed))
}

pub fn decode_byte_str(input: &[u8]) -> Result<(&[u8], usize), AuthError> {
    let (major, len, consumed) = decode_header(input)?;
    if major != MAJOR_BYTES {
        return Err(AuthError::UnsupportedItem);
    }
    let end = consumed
        .checked_add(len as usize)
        .ok_or(AuthError::Truncated)?;
    if input.len() < end {
        return Err(AuthError::Truncated);
    }
    Ok((&input[consumed..end], end))
}

pub fn decode_text_str(input: &[u8]) -> Result<(&str, usize), AuthError> {
    let (major, len, consumed) = decode_header(input)?;
    if major != MAJOR_TEXT {
        return Err(AuthError::UnsupportedItem);
    }
    let end = consumed
        .checked_add(len as usize)
        .ok_or(AuthError::Truncated)?;
    if input.len() < end {
        return Err(AuthError::Truncated);
    }
    let text = std::str::from_utf8(&input[consumed..end]).map_err(|_| AuthError::InvalidUtf8)?;
    Ok((text, end))
}

pub fn decode_array_header(input: &[u8]) -> Result<(u32, usize), AuthError> {
    let (major, len, consumed) = decode_header(input)?;
    if major != MAJOR_ARRAY {
        return Err(AuthError::UnsupportedItem);
    }
    Ok((len, consumed))
}

/// Total byte length of the first data item, including its payload for
/// strings. Array headers count as a bare item.
pub fn item_len(input: &[u8]) -> Result<usize, AuthError> {
    let (major, value, consumed) = decode_header(input)?;
    match major {
        MAJOR_UINT | MAJOR_ARRAY => Ok(consumed),
        MAJOR_BYTES | MAJOR_TEXT => {
            let end = consumed
                .checked_add(value as usize)
                .ok_or(AuthError::Truncated)?;
            if input.len() < end {
                return Err(AuthError::Truncated);
            }
            Ok(end)
        }
        _ => Err(AuthError::UnsupportedItem),
    }
}

fn encode_header(major: u8, value: u32, out: &mut Vec<u8>) {
    let tag = major << 5;
    if value < 24 {
        out.push(tag | value as u8);
    } else if value <= 0xff {
        out.push(tag | 24);
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(tag | 25);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else {
        out.push(tag | 26);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn decode_header(input: &[u8]) -> Result<(u8, u32, usize), AuthError> {
    let first = *input.first().ok_or(AuthError::Truncated)?;
    let major = first >> 5;
    if !matches!(major, MAJOR_UINT | MAJOR_BYTES | MAJOR_TEXT | MAJOR_ARRAY) {
        return Err(AuthError::UnsupportedItem);
    }
    let info = first & 0x1f;
    let (value, consumed): (u32, usize) = match info {
        0..=23 => (info as u32, 1),
        24 => {
            let b = *input.get(1).ok_or(AuthError::Truncated)?;
            if b < 24 {
                return Err(AuthError::NonCanonical);
            }
            (b as u32, 2)
        }
        25 => {
            let bytes: [u8; 2] = input
                .get(1..3)
                .ok_or(AuthError::Truncated)?
                .try_into()
                .map_err(|_| AuthError::Truncated)?;
            let v = u16::from_be_bytes(bytes) as u32;
            if v <= 0xff {
                return Err(AuthError::NonCanonical);
            }
            (v, 3)
        }
        26 => {
            let bytes: [u8; 4] = input
                .get(1..5)
                .ok_or(AuthError::Truncated)?
                .try_into()
                .map_err(|_| AuthError::Truncated)?;
            let v = u32::from_be_bytes(bytes);
            if v <= 0xffff {
                return Err(AuthError::NonCanonical);
            }
            (v, 5)
        }
        // 64-bit and indefinite lengths are outside the profile.
        _ => return Err(AuthError::UnsupportedItem),
    };
    Ok((major, value, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint_bytes(v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        encode_uint(v, &mut out);
        out
    }

    #[test]
    fn uint_boundaries_round_trip() {
        for v in [0u32, 1, 23, 24, 255, 256, 0xffff, 0x1_0000, u32::MAX] {
            let encoded = uint_bytes(v);
            let (decoded, consumed) = decode_uint(&encoded).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, encoded.len());
        }
        assert_eq!(uint_bytes(0), [0x00]);
        assert_eq!(uint_bytes(23), [0x17]);
        assert_eq!(uint_bytes(24), [0x18, 24]);
        assert_eq!(uint_bytes(256), [0x19, 0x01, 0x00]);
        assert_eq!(uint_bytes(0x1_0000), [0x1a, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn strings_round_trip() {
        let mut out = Vec::new();
        encode_byte_str(b"abc", &mut out);
        let (bytes, consumed) = decode_byte_str(&out).unwrap();
        assert_eq!(bytes, b"abc");
        assert_eq!(consumed, out.len());

        let mut out = Vec::new();
        encode_text_str("privet", &mut out);
        let (text, _) = decode_text_str(&out).unwrap();
        assert_eq!(text, "privet");
    }

    #[test]
    fn array_headers_round_trip() {
        let mut out = Vec::new();
        encode_array_header(2, &mut out);
        assert_eq!(out, [0x82]);
        assert_eq!(decode_array_header(&out).unwrap(), (2, 1));
    }

    #[test]
    fn rejects_foreign_major_types() {
        // Negative integer -1.
        assert!(matches!(decode_uint(&[0x20]), Err(AuthError::UnsupportedItem)));
        // Map header.
        assert!(matches!(item_len(&[0xa1]), Err(AuthError::UnsupportedItem)));
        // Float.
        assert!(matches!(
            item_len(&[0xfa, 0, 0, 0, 0]),
            Err(AuthError::UnsupportedItem)
        ));
        // Tagged item.
        assert!(matches!(item_len(&[0xc0]), Err(AuthError::UnsupportedItem)));
    }

    #[test]
    fn rejects_non_canonical_lengths() {
        // 10 encoded with a one-byte argument instead of immediate.
        assert!(matches!(
            decode_uint(&[0x18, 10]),
            Err(AuthError::NonCanonical)
        ));
        // 255 encoded in two bytes.
        assert!(matches!(
            decode_uint(&[0x19, 0x00, 0xff]),
            Err(AuthError::NonCanonical)
        ));
    }

    #[test]
    fn rejects_truncation() {
        assert!(matches!(decode_uint(&[]), Err(AuthError::Truncated)));
        assert!(matches!(decode_uint(&[0x19, 0x01]), Err(AuthError::Truncated)));
        let mut out = Vec::new();
        encode_byte_str(&[1, 2, 3, 4], &mut out);
        assert!(matches!(
            decode_byte_str(&out[..3]),
            Err(AuthError::Truncated)
        ));
    }

    #[test]
    fn item_len_spans_payloads() {
        let mut out = Vec::new();
        encode_byte_str(&[9; 30], &mut out);
        assert_eq!(item_len(&out).unwrap(), 32);
        assert_eq!(item_len(&uint_bytes(500)).unwrap(), 3);
    }
}
