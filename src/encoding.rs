//! Text codecs for field elements shared by every persisted or transported
//! artifact in the crate.
//!
//! Two encodings are used:
//!
//! * **hex**: `0x`-prefixed, 64 digit big-endian hex.  Used for public JSON
//!   (claim states, identity records, signals) where legibility matters.
//! * **compact**: base64 of the minimal big-endian byte string.  Used for the
//!   membership-map node tables where thousands of values are stored and the
//!   leading zero bytes of small keys would dominate the payload.
//!
//! Both decoders reject values that are not canonical field elements.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField, Zero};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use thiserror::Error;

/// Protocol field element (BN254 scalar field).
pub type Element = Fr;

/// Size in bytes of a canonical element encoding.
pub const ELEMENT_BYTES: usize = 32;

/// Errors raised while decoding element text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("invalid hex: {0}")]
    /// Input was not valid hexadecimal.
    Hex(String),
    #[error("invalid base64: {0}")]
    /// Input was not valid base64.
    Base64(String),
    #[error("value exceeds {ELEMENT_BYTES} bytes")]
    /// Input decoded to more bytes than an element can hold.
    TooLong,
    #[error("value is not a canonical field element")]
    /// Input is larger than the field modulus.
    NonCanonical,
    #[error("invalid integer: {0}")]
    /// Input could not be parsed as an integer.
    Integer(String),
}

/// Returns the canonical 32-byte little-endian encoding of `value`.
pub fn element_to_le_bytes(value: &Element) -> [u8; ELEMENT_BYTES] {
    let mut out = [0u8; ELEMENT_BYTES];
    out.copy_from_slice(&value.into_bigint().to_bytes_le());
    out
}

/// Returns the canonical 32-byte big-endian encoding of `value`.
pub fn element_to_be_bytes(value: &Element) -> [u8; ELEMENT_BYTES] {
    let mut out = [0u8; ELEMENT_BYTES];
    out.copy_from_slice(&value.into_bigint().to_bytes_be());
    out
}

/// Decodes big-endian bytes, rejecting anything that would wrap the modulus.
pub fn element_from_be_bytes(bytes: &[u8]) -> Result<Element, EncodingError> {
    if bytes.len() > ELEMENT_BYTES {
        return Err(EncodingError::TooLong);
    }
    let value = Element::from_be_bytes_mod_order(bytes);
    let mut padded = [0u8; ELEMENT_BYTES];
    padded[ELEMENT_BYTES - bytes.len()..].copy_from_slice(bytes);
    if element_to_be_bytes(&value) != padded {
        return Err(EncodingError::NonCanonical);
    }
    Ok(value)
}

/// Encodes an element as `0x`-prefixed big-endian hex.
pub fn element_to_hex(value: &Element) -> String {
    format!("0x{}", hex::encode(element_to_be_bytes(value)))
}

/// Parses hex with or without the `0x` prefix; short inputs are left-padded.
pub fn element_from_hex(input: &str) -> Result<Element, EncodingError> {
    let digits = input.trim().trim_start_matches("0x");
    let padded = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_string()
    };
    let bytes = hex::decode(padded).map_err(|err| EncodingError::Hex(err.to_string()))?;
    element_from_be_bytes(&bytes)
}

/// Encodes an element as base64 of its minimal big-endian bytes.
///
/// Zero encodes as the empty string.
pub fn element_to_compact(value: &Element) -> String {
    let bytes = element_to_be_bytes(value);
    let first = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(ELEMENT_BYTES);
    BASE64.encode(&bytes[first..])
}

/// Inverse of [`element_to_compact`].
pub fn element_from_compact(input: &str) -> Result<Element, EncodingError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| EncodingError::Base64(err.to_string()))?;
    element_from_be_bytes(&bytes)
}

/// Maps a signed integer into the field (`-1` becomes `p - 1`).
pub fn element_from_i64(value: i64) -> Element {
    let magnitude = Element::from(value.unsigned_abs());
    if value < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Returns the value as `u64` when it fits, `None` otherwise.
pub fn element_to_u64(value: &Element) -> Option<u64> {
    let bytes = element_to_le_bytes(value);
    if bytes[8..].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    Some(u64::from_le_bytes(low))
}

/// Bytes packed per element by [`bytes_to_elements`]; always below the modulus.
pub const PACKED_BYTES: usize = 31;

/// Packs bytes into elements, [`PACKED_BYTES`] little-endian bytes each.
pub fn bytes_to_elements(bytes: &[u8]) -> Vec<Element> {
    bytes
        .chunks(PACKED_BYTES)
        .map(Element::from_le_bytes_mod_order)
        .collect()
}

/// Parses a UID (hex digits, optional `0x`) into an element.
pub fn uid_to_element(uid: &str) -> Result<Element, EncodingError> {
    element_from_hex(uid)
}

/// Renders an element as a UID: lowercase hex without prefix or leading zeros.
pub fn element_to_uid(value: &Element) -> String {
    if value.is_zero() {
        return "0".to_string();
    }
    let encoded = hex::encode(element_to_be_bytes(value));
    encoded.trim_start_matches('0').to_string()
}

/// Generates a random 128-bit UID (32 hex digits).
pub fn new_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Serde adapter storing an [`Element`] as `0x` hex.
pub mod hex_element {
    use super::{element_from_hex, element_to_hex, Element};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes the element as hex text.
    pub fn serialize<S: Serializer>(value: &Element, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&element_to_hex(value))
    }

    /// Deserializes hex text into an element.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Element, D::Error> {
        let text = String::deserialize(deserializer)?;
        element_from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter storing an `Option<Element>` as optional `0x` hex.
pub mod hex_element_opt {
    use super::{element_from_hex, element_to_hex, Element};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes the optional element as hex text or `null`.
    pub fn serialize<S: Serializer>(
        value: &Option<Element>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&element_to_hex(value)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes optional hex text.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Element>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| element_from_hex(&t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::One;

    #[test]
    fn hex_roundtrip_and_short_forms() {
        let value = Element::from(0xdead_beefu64);
        let hex = element_to_hex(&value);
        assert_eq!(hex.len(), 66);
        assert_eq!(element_from_hex(&hex).unwrap(), value);
        assert_eq!(element_from_hex("deadbeef").unwrap(), value);
        assert_eq!(element_from_hex("0xf").unwrap(), Element::from(15u64));
    }

    #[test]
    fn compact_encoding_is_minimal() {
        assert_eq!(element_to_compact(&Element::zero()), "");
        assert_eq!(element_from_compact("").unwrap(), Element::zero());
        let one = element_to_compact(&Element::one());
        assert_eq!(one, "AQ==");
        assert_eq!(element_from_compact(&one).unwrap(), Element::one());
        let big = -Element::one();
        assert_eq!(element_from_compact(&element_to_compact(&big)).unwrap(), big);
    }

    #[test]
    fn rejects_non_canonical_values() {
        let all_ones = "f".repeat(64);
        assert_eq!(
            element_from_hex(&all_ones),
            Err(EncodingError::NonCanonical)
        );
        assert_eq!(
            element_from_hex(&"1".repeat(66)),
            Err(EncodingError::TooLong)
        );
    }

    #[test]
    fn signed_and_unsigned_helpers() {
        assert_eq!(element_from_i64(-1), -Element::one());
        assert_eq!(element_from_i64(7), Element::from(7u64));
        assert_eq!(element_to_u64(&Element::from(42u64)), Some(42));
        assert_eq!(element_to_u64(&-Element::one()), None);
    }

    #[test]
    fn packing_keeps_every_byte() {
        let bytes = [0xffu8; 36];
        let packed = bytes_to_elements(&bytes);
        assert_eq!(packed.len(), 2);
        assert_eq!(element_to_le_bytes(&packed[0])[..PACKED_BYTES], [0xff; PACKED_BYTES]);
        assert_eq!(element_to_u64(&packed[1]), Some((1 << 40) - 1));
        assert!(bytes_to_elements(&[]).is_empty());
    }

    #[test]
    fn uid_roundtrip() {
        let uid = new_uid();
        assert_eq!(uid.len(), 32);
        let element = uid_to_element(&uid).unwrap();
        assert_eq!(element_to_uid(&element), uid.trim_start_matches('0'));
        assert_eq!(element_to_uid(&Element::zero()), "0");
    }
}
