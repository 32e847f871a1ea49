//! The sealed-envelope codec spoken on the gateway wire.
//!
//! Every payload exchanged with the payment gateway travels as an *envelope*:
//! the form-urlencoded plaintext is AES-256-GCM encrypted under the merchant
//! hash key and IV, and the envelope string is
//! `hex( base64(ciphertext) ++ ":::" ++ base64(tag) )`. Alongside it rides a
//! `HashInfo` signature: the uppercase-hex SHA-256 of
//! `key ++ envelope ++ iv`, where key and iv are the configured ASCII
//! strings. The hash is a shared-secret construction the gateway defines,
//! not an HMAC; signature comparison must use [`equals_ct`].
//!
//! The gateway fixes a 16-byte IV, so the cipher is instantiated with a
//! 16-byte GCM nonce (`ring`'s AEAD API only accepts 96-bit nonces, hence
//! the RustCrypto `aes-gcm` backend here).

use std::fmt;

use aes_gcm::{
    aead::generic_array::{typenum::U16, GenericArray},
    aes::Aes256,
    AeadInPlace, AesGcm, KeyInit, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use crate::hex;

/// AES-256-GCM with the gateway's 16-byte IV.
type EnvelopeCipher = AesGcm<Aes256, U16>;

/// Separator between the ciphertext and tag halves of an envelope.
const SEPARATOR: &str = ":::";

/// serialized AES-256-GCM tag length
const TAG_LEN: usize = 16;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Errors produced by the seal codec. All are non-retryable; they indicate
/// tampering or a configuration mismatch between us and the gateway.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SealError {
    #[error("invalid envelope: ciphertext or tag may be corrupted")]
    InvalidEnvelope,

    #[error("envelope encoding error")]
    Encoding,

    #[error("hash key must be exactly {KEY_LEN} bytes, got {actual}")]
    KeyLength { actual: usize },

    #[error("hash IV must be exactly {IV_LEN} bytes, got {actual}")]
    IvLength { actual: usize },
}

/// The merchant hash key and IV, as configured with the gateway.
///
/// Both are used twice: as raw AES-256-GCM key material, and as the ASCII
/// salt strings of the `HashInfo` signature.
#[derive(Clone)]
pub struct SealKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl fmt::Debug for SealKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealKeys(..)")
    }
}

impl SealKeys {
    pub fn new(key: &str, iv: &str) -> Result<Self, SealError> {
        let key = <[u8; KEY_LEN]>::try_from(key.as_bytes()).map_err(|_| {
            SealError::KeyLength {
                actual: key.len(),
            }
        })?;
        let iv = <[u8; IV_LEN]>::try_from(iv.as_bytes()).map_err(|_| {
            SealError::IvLength {
                actual: iv.len(),
            }
        })?;
        Ok(Self { key, iv })
    }

    fn cipher(&self) -> EnvelopeCipher {
        EnvelopeCipher::new(GenericArray::from_slice(&self.key))
    }

    /// Seal a plaintext into an envelope string.
    pub fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let mut buf = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(
                GenericArray::from_slice(&self.iv),
                b"",
                &mut buf,
            )
            .map_err(|_| SealError::Encoding)?;

        let ascii =
            format!("{}{SEPARATOR}{}", BASE64.encode(&buf), BASE64.encode(tag));
        Ok(hex::encode(ascii.as_bytes()))
    }

    /// Open an envelope string back into its plaintext.
    ///
    /// Malformed hex, a missing separator, bad base64, a GCM tag failure, or
    /// non-UTF-8 plaintext all surface as [`SealError::InvalidEnvelope`].
    pub fn open(&self, envelope: &str) -> Result<String, SealError> {
        let ascii =
            hex::decode(envelope).map_err(|_| SealError::InvalidEnvelope)?;
        let ascii = std::str::from_utf8(&ascii)
            .map_err(|_| SealError::InvalidEnvelope)?;

        let (ciphertext_b64, tag_b64) = ascii
            .split_once(SEPARATOR)
            .ok_or(SealError::InvalidEnvelope)?;

        let mut buf = BASE64
            .decode(ciphertext_b64)
            .map_err(|_| SealError::InvalidEnvelope)?;
        let tag = BASE64
            .decode(tag_b64)
            .map_err(|_| SealError::InvalidEnvelope)?;
        if tag.len() != TAG_LEN {
            return Err(SealError::InvalidEnvelope);
        }

        self.cipher()
            .decrypt_in_place_detached(
                GenericArray::from_slice(&self.iv),
                b"",
                &mut buf,
                Tag::from_slice(&tag),
            )
            .map_err(|_| SealError::InvalidEnvelope)?;

        String::from_utf8(buf).map_err(|_| SealError::InvalidEnvelope)
    }

    /// Compute the gateway `HashInfo` signature for an envelope: the
    /// uppercase-hex SHA-256 of `key ++ envelope ++ iv`, streamed through
    /// one digest context so the key material is never copied into a
    /// concatenation buffer.
    pub fn hash(&self, envelope: &str) -> String {
        let mut digest = ring::digest::Context::new(&ring::digest::SHA256);
        digest.update(&self.key);
        digest.update(envelope.as_bytes());
        digest.update(&self.iv);
        hex::encode_upper(digest.finish().as_ref())
    }

    /// Verify an inbound `(envelope, hash)` pair in constant time.
    pub fn verify(&self, envelope: &str, hash: &str) -> bool {
        equals_ct(self.hash(envelope).as_bytes(), hash.as_bytes())
    }
}

/// Constant-time equality of byte sequences. Unequal lengths return false
/// without comparing any bytes.
pub fn equals_ct(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}
