//! Utilities for encoding, decoding, and displaying hex-formatted data.

use std::fmt;

use thiserror::Error;

/// Errors which can be produced while decoding a hex string.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("hex decode error: input contains non-hex character")]
    InvalidCharacter,

    #[error("hex decode error: input string length must be even")]
    OddInputLength,
}

/// Convert a byte slice to an owned lowercase hex string. If you simply need
/// to display a byte slice as hex, use [`display`] instead, which avoids the
/// allocation.
pub fn encode(bytes: &[u8]) -> String {
    encode_with(bytes, b"0123456789abcdef")
}

/// Convert a byte slice to an owned UPPERCASE hex string, as required for
/// gateway `HashInfo` signatures.
pub fn encode_upper(bytes: &[u8]) -> String {
    encode_with(bytes, b"0123456789ABCDEF")
}

fn encode_with(bytes: &[u8], table: &[u8; 16]) -> String {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(table[usize::from(b >> 4)]);
        out.push(table[usize::from(b & 0x0f)]);
    }
    // Hex characters are always valid UTF-8.
    String::from_utf8(out).expect("hex output is ASCII")
}

/// Try to decode a hex string (either case) to owned bytes (`Vec<u8>`).
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }

    hex.chunks_exact(2)
        .map(|pair| {
            let hi = decode_nibble(pair[0])?;
            let lo = decode_nibble(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn decode_nibble(c: u8) -> Result<u8, DecodeError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(DecodeError::InvalidCharacter),
    }
}

/// Get a [`HexDisplay`] which provides `Debug` and `Display` impls for the
/// given byte slice. Useful for displaying a hex value without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

/// See [`display`].
pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn encode_basic() {
        assert_eq!(encode(&[]), "");
        assert_eq!(encode(&[0x00, 0xff, 0x69]), "00ff69");
        assert_eq!(encode_upper(&[0x00, 0xff, 0x69]), "00FF69");
        assert_eq!(display(&[0xde, 0xad]).to_string(), "dead");
    }

    #[test]
    fn decode_rejects_bad_inputs() {
        assert_eq!(decode("abc"), Err(DecodeError::OddInputLength));
        assert_eq!(decode("zz"), Err(DecodeError::InvalidCharacter));
        assert_eq!(decode("0 "), Err(DecodeError::InvalidCharacter));
    }

    #[test]
    fn decode_accepts_both_cases() {
        assert_eq!(decode("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        proptest!(|(bytes in vec(any::<u8>(), 0..=64))| {
            prop_assert_eq!(decode(&encode(&bytes)).unwrap(), bytes.clone());
            prop_assert_eq!(decode(&encode_upper(&bytes)).unwrap(), bytes);
        });
    }
}
