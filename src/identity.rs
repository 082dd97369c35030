//! Pseudonymous elector identities.
//!
//! An [`Identity`] owns a freshly generated Baby Jubjub key pair that is never
//! associated with any on-chain account, so signatures made with it cannot be
//! traced back to a wallet.  The public face of the identity is its
//! `commitment = hash(publicKey.x, publicKey.y, pin)`; groups store
//! commitments, never keys.
//!
//! The full record, secret key included, is the only secret-bearing artifact
//! in the protocol and is persisted through an [`IdentityVault`].

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{hex_element, Element};
use crate::hash::hash_elements;
use crate::keys::{KeyError, PublicKey, SecretKey};

/// Number of digits a pin is padded to.
pub const PIN_DIGITS: usize = 6;

/// Errors raised by identity creation, validation and persistence.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("pin must be 1 to {PIN_DIGITS} decimal digits")]
    /// Pin was empty, too long or not numeric.
    InvalidPin,
    #[error("label is empty after cleaning")]
    /// Label contained no usable characters.
    InvalidLabel,
    #[error("key decode error: {0}")]
    /// Stored key material could not be decoded.
    Key(String),
    #[error("identity I/O error: {0}")]
    /// Underlying filesystem failure.
    Io(#[from] std::io::Error),
    #[error("identity record error: {0}")]
    /// Record JSON was malformed.
    Json(#[from] serde_json::Error),
}

impl From<KeyError> for IdentityError {
    fn from(err: KeyError) -> Self {
        IdentityError::Key(err.to_string())
    }
}

/// Private identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User-assigned label, cleaned for use as a filename.
    pub label: String,
    /// `hash(publicKey.x, publicKey.y, pin)`.
    #[serde(with = "hex_element")]
    pub commitment: Element,
    /// Hex-encoded secret scalar.
    pub secret_key: String,
    /// Hex-encoded compressed public point.
    pub public_key: String,
    /// Zero-padded six digit pin.
    pub pin: String,
    /// `hash(secretKey)`, used to validate a re-entered secret key.
    #[serde(with = "hex_element")]
    pub secret_key_hash: Element,
    /// `hash(pin)`, used to validate a re-entered pin.
    #[serde(with = "hex_element")]
    pub pin_hash: Element,
}

impl Identity {
    /// Creates an identity with a new random key pair.
    pub fn create(label: &str, pin: &str) -> Result<Self, IdentityError> {
        Self::from_secret_key(label, pin, &SecretKey::generate(&mut OsRng))
    }

    /// Builds the record for an existing key; `create` is the usual entry point.
    pub fn from_secret_key(label: &str, pin: &str, secret: &SecretKey) -> Result<Self, IdentityError> {
        let label = clean_label(label);
        if label.is_empty() {
            return Err(IdentityError::InvalidLabel);
        }
        let pin = normalize_pin(pin)?;
        let pin_field = pin_to_field(&pin)?;
        let public = secret.public_key();
        Ok(Self {
            label,
            commitment: commitment_for(&public, &pin)?,
            secret_key: hex::encode(secret.to_bytes()),
            public_key: hex::encode(public.to_bytes()?),
            pin,
            secret_key_hash: hash_elements(&[secret.to_element()]),
            pin_hash: hash_elements(&[pin_field]),
        })
    }

    /// Decodes the secret key.
    pub fn secret(&self) -> Result<SecretKey, IdentityError> {
        Ok(SecretKey::from_bytes(&decode_hex(&self.secret_key)?)?)
    }

    /// Decodes the public key.
    pub fn public(&self) -> Result<PublicKey, IdentityError> {
        decode_public_key(&self.public_key)
    }

    /// The pin as the field element hashed into the commitment.
    pub fn pin_element(&self) -> Result<Element, IdentityError> {
        pin_to_field(&normalize_pin(&self.pin)?)
    }

    /// Recomputes the commitment from the stored public key and pin.
    pub fn verify_commitment(&self) -> bool {
        self.public()
            .and_then(|pk| commitment_for(&pk, &self.pin))
            .map(|c| c == self.commitment)
            .unwrap_or(false)
    }

    /// Checks a re-entered pin against the stored pin hash.
    pub fn check_pin(&self, pin: &str) -> bool {
        normalize_pin(pin)
            .and_then(|p| pin_to_field(&p))
            .map(|field| hash_elements(&[field]) == self.pin_hash)
            .unwrap_or(false)
    }

    /// Checks a re-entered hex secret key against the stored hash.
    pub fn check_secret_key(&self, secret_hex: &str) -> bool {
        decode_hex(secret_hex)
            .and_then(|bytes| Ok(SecretKey::from_bytes(&bytes)?))
            .map(|secret| hash_elements(&[secret.to_element()]) == self.secret_key_hash)
            .unwrap_or(false)
    }
}

/// Computes `hash(publicKey.x, publicKey.y, pin)`.
pub fn commitment_for(public_key: &PublicKey, pin: &str) -> Result<Element, IdentityError> {
    let pin = pin_to_field(&normalize_pin(pin)?)?;
    Ok(commitment_from_parts(public_key, &pin))
}

/// Commitment from a public key and an already encoded pin.
pub fn commitment_from_parts(public_key: &PublicKey, pin: &Element) -> Element {
    let [x, y] = public_key.coordinates();
    hash_elements(&[x, y, *pin])
}

/// Decodes a hex public key.
pub fn decode_public_key(input: &str) -> Result<PublicKey, IdentityError> {
    Ok(PublicKey::from_bytes(&decode_hex(input)?)?)
}

fn decode_hex(input: &str) -> Result<Vec<u8>, IdentityError> {
    hex::decode(input.trim()).map_err(|err| IdentityError::Key(err.to_string()))
}

fn normalize_pin(pin: &str) -> Result<String, IdentityError> {
    let pin = pin.trim();
    if pin.is_empty() || pin.len() > PIN_DIGITS || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdentityError::InvalidPin);
    }
    Ok(format!("{pin:0>width$}", width = PIN_DIGITS))
}

fn pin_to_field(pin: &str) -> Result<Element, IdentityError> {
    pin.parse::<u64>()
        .map(Element::from)
        .map_err(|_| IdentityError::InvalidPin)
}

/// Strips non-ASCII, maps whitespace runs to `_`, keeps `[A-Za-z0-9_.-]`.
pub fn clean_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = false;
    for c in input.chars().filter(|c| c.is_ascii()) {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
            out.push(c);
        }
    }
    out
}

/// Directory-backed store for private identity records.
#[derive(Debug, Clone)]
pub struct IdentityVault {
    dir: PathBuf,
}

impl IdentityVault {
    /// Opens a vault rooted at `dir` (created lazily on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the identity files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `label`.
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir
            .join(format!("{}.identity.json", clean_label(label)))
    }

    /// Writes the record, overwriting any previous record with the same label.
    pub fn save(&self, identity: &Identity) -> Result<PathBuf, IdentityError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&identity.label);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(identity)?)?;
        fs::rename(&tmp_path, &path)?;
        info!(label = %identity.label, path = %path.display(), "identity saved");
        Ok(path)
    }

    /// Reads the record for `label`.
    pub fn read(&self, label: &str) -> Result<Identity, IdentityError> {
        let path = self.path_for(label);
        debug!(path = %path.display(), "reading identity");
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
