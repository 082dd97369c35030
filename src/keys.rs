//! Schnorr signatures over Baby Jubjub.
//!
//! Identity keys live on the twisted Edwards curve whose base field is the
//! BN254 scalar field, so a signature can be checked inside a tally circuit
//! as cheaply as outside it.  The challenge is the Poseidon
//! [`hash_challenge`] of `(R, publicKey, message)`; nonces are derived
//! deterministically from the secret key and the message.

use ark_ec::{AffineRepr, CurveGroup, Group};
use ark_ed_on_bn254::{EdwardsAffine, EdwardsProjective, Fr as Scalar};
use ark_ff::{BigInteger, PrimeField, UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use std::fmt;
use thiserror::Error;

use crate::encoding::{element_to_le_bytes, Element};
use crate::hash::hash_challenge;

const NONCE_DOMAIN: &[u8] = b"CLAIM_TALLY_NONCE";

/// Encoded length of a secret or public key.
pub const KEY_BYTES: usize = 32;
/// Encoded length of a signature: `R || s`.
pub const SIGNATURE_BYTES: usize = 64;

/// Key and signature decoding failures.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("expected {expected} bytes, got {actual}")]
    /// Input had the wrong length.
    Length {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
    #[error("invalid key encoding: {0}")]
    /// Bytes are not a canonical scalar or subgroup point.
    Encoding(String),
    #[error("key is the identity")]
    /// Zero secret key or identity point.
    Degenerate,
}

/// What a signature authorizes; its tag is the first signed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// `(signal, nullifier)` of a vote.
    Signal,
    /// `(commitment, context)` of an ownership proof.
    Ownership,
}

impl Purpose {
    /// Element prefixed to the signed pair.
    pub fn tag(self) -> Element {
        match self {
            Purpose::Signal => Element::from(1u64),
            Purpose::Ownership => Element::from(2u64),
        }
    }

    /// The three elements a signature for this purpose covers.
    pub fn message(self, first: &Element, second: &Element) -> [Element; 3] {
        [self.tag(), *first, *second]
    }
}

/// Secret scalar of an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Scalar);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Public point `sk·G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(EdwardsAffine);

/// Schnorr signature `(R, s)` with `s·G = R + e·pk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Nonce commitment `R = k·G`.
    pub nonce_point: EdwardsAffine,
    /// Response `s = k + e·sk`.
    pub response: Scalar,
}

/// Baby Jubjub scalar embedded into the BN254 scalar field.
pub fn scalar_to_element(scalar: &Scalar) -> Element {
    Element::from_le_bytes_mod_order(&scalar.into_bigint().to_bytes_le())
}

fn element_to_scalar(element: &Element) -> Scalar {
    Scalar::from_le_bytes_mod_order(&element.into_bigint().to_bytes_le())
}

fn check_length(bytes: &[u8], expected: usize) -> Result<(), KeyError> {
    if bytes.len() != expected {
        return Err(KeyError::Length {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn challenge(nonce_point: &EdwardsAffine, public_key: &EdwardsAffine, message: &[Element]) -> Element {
    let mut inputs = vec![nonce_point.x, nonce_point.y, public_key.x, public_key.y];
    inputs.extend_from_slice(message);
    hash_challenge(&inputs)
}

impl SecretKey {
    /// Draws a fresh nonzero key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let scalar = Scalar::rand(rng);
            if !scalar.is_zero() {
                return Self(scalar);
            }
        }
    }

    /// Decodes a canonical little-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        check_length(bytes, KEY_BYTES)?;
        let scalar = Scalar::deserialize_compressed(bytes).map_err(|e| KeyError::Encoding(e.to_string()))?;
        if scalar.is_zero() {
            return Err(KeyError::Degenerate);
        }
        Ok(Self(scalar))
    }

    /// Little-endian scalar bytes.
    pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
        let mut out = [0u8; KEY_BYTES];
        out.copy_from_slice(&self.0.into_bigint().to_bytes_le());
        out
    }

    /// The scalar as a field element, used for nullifiers.
    pub fn to_element(&self) -> Element {
        scalar_to_element(&self.0)
    }

    /// Matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey((EdwardsProjective::generator() * self.0).into_affine())
    }

    /// Signs `message`.
    pub fn sign(&self, message: &[Element]) -> Signature {
        let mut hasher = Sha512::new();
        hasher.update(NONCE_DOMAIN);
        hasher.update(self.to_bytes());
        for element in message {
            hasher.update(element_to_le_bytes(element));
        }
        let nonce = Scalar::from_le_bytes_mod_order(&hasher.finalize());
        let nonce_point = (EdwardsProjective::generator() * nonce).into_affine();
        let e = element_to_scalar(&challenge(&nonce_point, &self.public_key().0, message));
        Signature {
            nonce_point,
            response: nonce + e * self.0,
        }
    }
}

impl PublicKey {
    /// Decodes a compressed subgroup point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        check_length(bytes, KEY_BYTES)?;
        let point =
            EdwardsAffine::deserialize_compressed(bytes).map_err(|e| KeyError::Encoding(e.to_string()))?;
        if point.is_zero() {
            return Err(KeyError::Degenerate);
        }
        Ok(Self(point))
    }

    /// Compressed point bytes.
    pub fn to_bytes(&self) -> Result<[u8; KEY_BYTES], KeyError> {
        let mut out = Vec::with_capacity(KEY_BYTES);
        self.0
            .serialize_compressed(&mut out)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        out.try_into()
            .map_err(|out: Vec<u8>| KeyError::Length { expected: KEY_BYTES, actual: out.len() })
    }

    /// Affine point.
    pub fn point(&self) -> &EdwardsAffine {
        &self.0
    }

    /// Affine coordinates as field elements.
    pub fn coordinates(&self) -> [Element; 2] {
        [self.0.x, self.0.y]
    }

    /// Checks `signature` over `message`.
    pub fn verify(&self, message: &[Element], signature: &Signature) -> bool {
        let e = element_to_scalar(&challenge(&signature.nonce_point, &self.0, message));
        EdwardsProjective::generator() * signature.response == signature.nonce_point.into_group() + self.0 * e
    }
}

impl Signature {
    /// `R || s`, point compressed and scalar little-endian.
    pub fn to_bytes(&self) -> Result<[u8; SIGNATURE_BYTES], KeyError> {
        let mut out = Vec::with_capacity(SIGNATURE_BYTES);
        self.nonce_point
            .serialize_compressed(&mut out)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        self.response
            .serialize_compressed(&mut out)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        out.try_into()
            .map_err(|out: Vec<u8>| KeyError::Length { expected: SIGNATURE_BYTES, actual: out.len() })
    }

    /// Inverse of [`Signature::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        check_length(bytes, SIGNATURE_BYTES)?;
        let (point, scalar) = bytes.split_at(KEY_BYTES);
        Ok(Self {
            nonce_point: EdwardsAffine::deserialize_compressed(point)
                .map_err(|e| KeyError::Encoding(e.to_string()))?,
            response: Scalar::deserialize_compressed(scalar).map_err(|e| KeyError::Encoding(e.to_string()))?,
        })
    }

    /// Response as a field element, for circuit witnesses.
    pub fn response_element(&self) -> Element {
        scalar_to_element(&self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn signature_binds_key_and_message() {
        let sk = SecretKey::generate(&mut OsRng);
        let pk = sk.public_key();
        let message = Purpose::Signal.message(&Element::from(3u64), &Element::from(4u64));
        let signature = sk.sign(&message);
        assert!(pk.verify(&message, &signature));

        let other = Purpose::Ownership.message(&Element::from(3u64), &Element::from(4u64));
        assert!(!pk.verify(&other, &signature));
        let stranger = SecretKey::generate(&mut OsRng).public_key();
        assert!(!stranger.verify(&message, &signature));
    }

    #[test]
    fn signing_is_deterministic() {
        let mut bytes = [7u8; KEY_BYTES];
        bytes[KEY_BYTES - 1] = 0;
        let sk = SecretKey::from_bytes(&bytes).unwrap();
        let message = [Element::from(1u64)];
        assert_eq!(sk.sign(&message), sk.sign(&message));
    }

    #[test]
    fn encodings_roundtrip_and_reject_garbage() {
        let sk = SecretKey::generate(&mut OsRng);
        assert_eq!(SecretKey::from_bytes(&sk.to_bytes()).unwrap(), sk);
        let pk = sk.public_key();
        assert_eq!(PublicKey::from_bytes(&pk.to_bytes().unwrap()).unwrap(), pk);
        let signature = sk.sign(&[Element::from(9u64)]);
        assert_eq!(Signature::from_bytes(&signature.to_bytes().unwrap()).unwrap(), signature);

        assert!(matches!(SecretKey::from_bytes(&[0u8; KEY_BYTES]), Err(KeyError::Degenerate)));
        assert!(matches!(SecretKey::from_bytes(&[1u8; 5]), Err(KeyError::Length { .. })));
        assert!(SecretKey::from_bytes(&[0xffu8; KEY_BYTES]).is_err());
    }
}
