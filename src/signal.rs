//! Signed, nullifier-bound vote signals.
//!
//! A [`Signal`] carries a `message` about a `topic` (usually a claim UID).
//! Its `nullifier = hash(secretKey, topic)` is deterministic per
//! identity and topic, so a second signal from the same identity on the same
//! topic is detectable by a plain non-membership check without revealing who
//! produced it.  The Schnorr signature covers `(hash, nullifier)` under
//! [`Purpose::Signal`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::encoding::{element_from_i64, hex_element, Element};
use crate::hash::{hash_bytes, hash_elements};
use crate::identity::{decode_public_key, Identity, IdentityError};
use crate::keys::{KeyError, Purpose, PublicKey, Signature};

const ENCRYPTION_DOMAIN: &[u8] = b"CLAIM_TALLY_SIGNAL_KEY";
const NONCE_BYTES: usize = 24;

/// Errors raised while building, signing or opening signals.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error(transparent)]
    /// Identity key material could not be used.
    Identity(#[from] IdentityError),
    #[error(transparent)]
    /// Signature could not be encoded.
    Key(#[from] KeyError),
    #[error("signal is not signed")]
    /// Verification requested on an unsigned signal.
    Unsigned,
    #[error("signature decode error: {0}")]
    /// Signature text was malformed.
    Decode(String),
    #[error("signature verification failed")]
    /// Signature does not match `(hash, nullifier)` under the given key.
    BadSignature,
    #[error("encryption failed: {0}")]
    /// Cipher failure while encrypting.
    Encrypt(String),
    #[error("decryption failed: {0}")]
    /// Cipher failure or malformed ciphertext while decrypting.
    Decrypt(String),
    #[error("vote value outside {{-1, 0, 1}}")]
    /// A vote element was not in the ternary domain.
    VoteOutOfDomain,
}

/// Ternary vote value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    /// `+1`.
    Positive,
    /// `-1`.
    Negative,
    /// `0`, counted as ignored.
    Abstain,
}

impl Vote {
    /// Integer value of the vote.
    pub fn value(self) -> i64 {
        match self {
            Vote::Positive => 1,
            Vote::Negative => -1,
            Vote::Abstain => 0,
        }
    }

    /// Field encoding of the vote (`-1` maps to `p - 1`).
    pub fn to_element(self) -> Element {
        element_from_i64(self.value())
    }

    /// Decodes a field element, rejecting anything outside `{-1, 0, 1}`.
    pub fn from_element(value: &Element) -> Result<Self, SignalError> {
        [Vote::Positive, Vote::Negative, Vote::Abstain]
            .into_iter()
            .find(|vote| vote.to_element() == *value)
            .ok_or(SignalError::VoteOutOfDomain)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Positive => write!(f, "+1"),
            Vote::Negative => write!(f, "-1"),
            Vote::Abstain => write!(f, "0"),
        }
    }
}

/// `hash(claimUid, elector, vote)`: the signal a tally step recomputes.
pub fn vote_signal(claim_uid: &Element, elector: &Element, vote: &Element) -> Element {
    hash_elements(&[*claim_uid, *elector, *vote])
}

/// `hash(secretKey, topic)` for the given identity.
pub fn nullifier_for(identity: &Identity, topic: &Element) -> Result<Element, SignalError> {
    Ok(hash_elements(&[identity.secret()?.to_element(), *topic]))
}

/// Decodes a base64 `R || s` signature.
pub fn decode_signature(signature_b64: &str) -> Result<Signature, SignalError> {
    let bytes = BASE64
        .decode(signature_b64)
        .map_err(|err| SignalError::Decode(err.to_string()))?;
    Signature::from_bytes(&bytes).map_err(|err| SignalError::Decode(err.to_string()))
}

/// Verifies a base64 signature over `(hash, nullifier)`.
pub fn verify_signal_signature(
    public_key: &PublicKey,
    hash: &Element,
    nullifier: &Element,
    signature_b64: &str,
) -> Result<(), SignalError> {
    let signature = decode_signature(signature_b64)?;
    if !public_key.verify(&Purpose::Signal.message(hash, nullifier), &signature) {
        return Err(SignalError::BadSignature);
    }
    Ok(())
}

/// A broadcastable signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// What the signal is about (usually a claim UID).
    #[serde(with = "hex_element")]
    pub topic: Element,
    /// Plain message; cleared once encrypted.
    pub message: String,
    /// `hash(secretKey, topic)`.
    #[serde(with = "hex_element")]
    pub nullifier: Element,
    /// Hash of the message that is signed and broadcast.
    #[serde(with = "hex_element")]
    pub hash: Element,
    /// Base64 signature over `(hash, nullifier)`; empty until signed.
    pub signature: String,
    /// Base64 `nonce || ciphertext`; empty until encrypted.
    pub encrypted: String,
}

impl Signal {
    /// Builds an unsigned signal with `hash = hash(byteEncoding(message))`.
    pub fn create(identity: &Identity, topic: Element, message: &str) -> Result<Self, SignalError> {
        Ok(Self {
            topic,
            message: message.to_string(),
            nullifier: nullifier_for(identity, &topic)?,
            hash: hash_bytes(message.as_bytes()),
            signature: String::new(),
            encrypted: String::new(),
        })
    }

    /// Builds the tally signal for a vote on `claim_uid`.
    ///
    /// The hash binds the vote to the claim and the elector's commitment so
    /// the aggregator can recompute it.
    pub fn for_vote(identity: &Identity, claim_uid: Element, vote: Vote) -> Result<Self, SignalError> {
        let mut signal = Self::create(identity, claim_uid, &vote.to_string())?;
        signal.hash = vote_signal(&claim_uid, &identity.commitment, &vote.to_element());
        Ok(signal)
    }

    /// Signs `(hash, nullifier)` with the identity's secret key.
    pub fn sign(mut self, identity: &Identity) -> Result<Self, SignalError> {
        let signature = identity
            .secret()?
            .sign(&Purpose::Signal.message(&self.hash, &self.nullifier));
        self.signature = BASE64.encode(signature.to_bytes()?);
        Ok(self)
    }

    /// Checks the signature against `public_key`.
    pub fn verify(&self, public_key: &PublicKey) -> Result<(), SignalError> {
        if self.signature.is_empty() {
            return Err(SignalError::Unsigned);
        }
        verify_signal_signature(public_key, &self.hash, &self.nullifier, &self.signature)
    }

    /// Replaces the plain message with its ciphertext.
    pub fn encrypt(mut self, identity: &Identity) -> Result<Self, SignalError> {
        let cipher = signal_cipher(identity)?;
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), self.message.as_bytes())
            .map_err(|err| SignalError::Encrypt(err.to_string()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        self.encrypted = BASE64.encode(sealed);
        self.message.clear();
        Ok(self)
    }

    /// Recovers the plain message from `encrypted`.
    pub fn decrypt(&self, identity: &Identity) -> Result<String, SignalError> {
        let sealed = BASE64
            .decode(&self.encrypted)
            .map_err(|err| SignalError::Decrypt(err.to_string()))?;
        if sealed.len() < NONCE_BYTES {
            return Err(SignalError::Decrypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
        let plain = signal_cipher(identity)?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|err| SignalError::Decrypt(err.to_string()))?;
        String::from_utf8(plain).map_err(|err| SignalError::Decrypt(err.to_string()))
    }
}

fn signal_cipher(identity: &Identity) -> Result<XChaCha20Poly1305, SignalError> {
    let secret = identity.secret()?;
    let mut hasher = Sha256::new();
    hasher.update(ENCRYPTION_DOMAIN);
    hasher.update(secret.to_bytes());
    let key: [u8; 32] = hasher.finalize().into();
    Ok(XChaCha20Poly1305::new((&key).into()))
}

/// Everything an elector hands to the aggregator for one vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    /// Elector identity commitment.
    #[serde(with = "hex_element")]
    pub elector: Element,
    /// Hex public key of the elector identity.
    pub elector_pk: String,
    /// Pin opening `elector` together with `elector_pk`.
    #[serde(with = "hex_element")]
    pub pin: Element,
    /// Signal hash, expected to equal `hash(claimUid, elector, vote)`.
    #[serde(with = "hex_element")]
    pub signal: Element,
    /// Signal nullifier.
    #[serde(with = "hex_element")]
    pub nullifier: Element,
    /// Base64 signature over `(signal, nullifier)`.
    pub signature: String,
    /// Raw vote element.
    #[serde(with = "hex_element")]
    pub vote: Element,
}

impl Ballot {
    /// Casts `vote` on `claim_uid` as `identity`.
    pub fn cast(identity: &Identity, claim_uid: Element, vote: Vote) -> Result<Self, SignalError> {
        let signal = Signal::for_vote(identity, claim_uid, vote)?.sign(identity)?;
        Self::from_signal(identity, &signal, vote.to_element())
    }

    /// Assembles a ballot from an already signed signal.
    pub fn from_signal(identity: &Identity, signal: &Signal, vote: Element) -> Result<Self, SignalError> {
        Ok(Self {
            elector: identity.commitment,
            elector_pk: identity.public_key.clone(),
            pin: identity.pin_element()?,
            signal: signal.hash,
            nullifier: signal.nullifier,
            signature: signal.signature.clone(),
            vote,
        })
    }

    /// Decodes the elector public key.
    pub fn public_key(&self) -> Result<PublicKey, SignalError> {
        Ok(decode_public_key(&self.elector_pk)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: &str) -> Identity {
        Identity::create(label, "123456").unwrap()
    }

    #[test]
    fn nullifier_is_identity_and_topic_bound() {
        let alice = identity("alice");
        let bob = identity("bob");
        let topic = Element::from(77u64);
        let a1 = Signal::create(&alice, topic, "+1").unwrap();
        let a2 = Signal::create(&alice, topic, "-1").unwrap();
        let b1 = Signal::create(&bob, topic, "+1").unwrap();
        let a_other = Signal::create(&alice, Element::from(78u64), "+1").unwrap();
        assert_eq!(a1.nullifier, a2.nullifier);
        assert_ne!(a1.nullifier, b1.nullifier);
        assert_ne!(a1.nullifier, a_other.nullifier);
        assert_eq!(a1.hash, b1.hash);
        assert_ne!(a1.hash, a2.hash);
    }

    #[test]
    fn signature_covers_hash_and_nullifier() {
        let alice = identity("alice");
        let vk = alice.public().unwrap();
        let signal = Signal::create(&alice, Element::from(5u64), "hello")
            .unwrap()
            .sign(&alice)
            .unwrap();
        assert!(signal.verify(&vk).is_ok());

        let mut tampered = signal.clone();
        tampered.nullifier += Element::from(1u64);
        assert!(matches!(tampered.verify(&vk), Err(SignalError::BadSignature)));

        let other = identity("eve").public().unwrap();
        assert!(matches!(signal.verify(&other), Err(SignalError::BadSignature)));
    }

    #[test]
    fn unsigned_signal_does_not_verify() {
        let alice = identity("alice");
        let signal = Signal::create(&alice, Element::from(5u64), "x").unwrap();
        assert!(matches!(
            signal.verify(&alice.public().unwrap()),
            Err(SignalError::Unsigned)
        ));
    }

    #[test]
    fn encryption_replaces_message() {
        let alice = identity("alice");
        let signal = Signal::create(&alice, Element::from(9u64), "+1")
            .unwrap()
            .sign(&alice)
            .unwrap()
            .encrypt(&alice)
            .unwrap();
        assert!(signal.message.is_empty());
        assert!(!signal.encrypted.is_empty());
        assert_eq!(signal.decrypt(&alice).unwrap(), "+1");
        assert!(signal.verify(&alice.public().unwrap()).is_ok());
        assert!(matches!(
            signal.decrypt(&identity("eve")),
            Err(SignalError::Decrypt(_))
        ));
    }

    #[test]
    fn vote_domain() {
        for vote in [Vote::Positive, Vote::Negative, Vote::Abstain] {
            assert_eq!(Vote::from_element(&vote.to_element()).unwrap(), vote);
        }
        assert!(matches!(
            Vote::from_element(&Element::from(2u64)),
            Err(SignalError::VoteOutOfDomain)
        ));
    }

    #[test]
    fn cast_ballot_binds_vote_to_claim_and_elector() {
        let alice = identity("alice");
        let claim = Element::from(1001u64);
        let ballot = Ballot::cast(&alice, claim, Vote::Positive).unwrap();
        assert_eq!(
            ballot.signal,
            vote_signal(&claim, &alice.commitment, &Vote::Positive.to_element())
        );
        assert_eq!(ballot.nullifier, nullifier_for(&alice, &claim).unwrap());
        verify_signal_signature(
            &ballot.public_key().unwrap(),
            &ballot.signal,
            &ballot.nullifier,
            &ballot.signature,
        )
        .unwrap();
        let json = serde_json::to_string(&ballot).unwrap();
        assert_eq!(serde_json::from_str::<Ballot>(&json).unwrap(), ballot);
    }
}
