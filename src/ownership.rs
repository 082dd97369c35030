//! Zero-knowledge proof that the caller owns an identity commitment.
//!
//! The proof shows knowledge of a public key and pin opening `commitment`, and
//! of the secret key behind that public key, without revealing any of them:
//! the circuit checks a Schnorr signature over `(commitment, context)`.
//! `context` is chosen by the verifier, so a proof cannot be replayed to a
//! different challenge.

use ark_bn254::Fr;
use ark_ec::AffineRepr;
use ark_ed_on_bn254::{EdwardsAffine, Fr as Scalar};
use ark_ff::Zero;
use ark_r1cs_std::{alloc::AllocVar, eq::EqGadget, fields::{fp::FpVar, FieldVar}};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoding::{hex_element, Element};
use crate::gadgets::{enforce_signature, HashGadget, PointVar};
use crate::identity::{Identity, IdentityError};
use crate::keys::{Purpose, Signature};
use crate::tally::backend::{CircuitShape, ProofBackend};
use crate::tally::circuit::satisfied;
use crate::tally::TallyError;

/// Assignment for one ownership proof.
#[derive(Debug, Clone)]
pub struct OwnershipCircuit {
    /// Public commitment being claimed.
    pub commitment: Element,
    /// Verifier challenge.
    pub context: Element,
    public_key: EdwardsAffine,
    pin: Element,
    signature: Signature,
}

impl OwnershipCircuit {
    /// Builds the witness for `identity` answering `context`.
    pub fn new(identity: &Identity, context: Element) -> Result<Self, IdentityError> {
        let commitment = identity.commitment;
        let signature = identity
            .secret()?
            .sign(&Purpose::Ownership.message(&commitment, &context));
        Ok(Self {
            commitment,
            context,
            public_key: *identity.public()?.point(),
            pin: identity.pin_element()?,
            signature,
        })
    }

    /// Placeholder assignment for key generation.
    pub fn blank() -> Self {
        let generator = EdwardsAffine::generator();
        Self {
            commitment: Element::zero(),
            context: Element::zero(),
            public_key: generator,
            pin: Element::zero(),
            signature: Signature {
                nonce_point: generator,
                response: Scalar::zero(),
            },
        }
    }

    /// `[commitment, context]`.
    pub fn public_inputs(&self) -> Vec<Element> {
        vec![self.commitment, self.context]
    }

    /// Synthesizes the circuit locally and reports whether it is satisfied.
    pub fn is_satisfied(&self) -> Result<bool, SynthesisError> {
        satisfied(self.clone())
    }
}

impl ConstraintSynthesizer<Fr> for OwnershipCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let commitment = FpVar::new_input(cs.clone(), || Ok(self.commitment))?;
        let context = FpVar::new_input(cs.clone(), || Ok(self.context))?;

        let hasher = HashGadget::new();
        let public_key = PointVar::new_witness(cs.clone(), || Ok(self.public_key))?;
        let pin = FpVar::new_witness(cs.clone(), || Ok(self.pin))?;
        hasher
            .hash_elements(&[public_key.x.clone(), public_key.y.clone(), pin])?
            .enforce_equal(&commitment)?;

        let nonce_point = PointVar::new_witness(cs.clone(), || Ok(self.signature.nonce_point))?;
        let response = FpVar::new_witness(cs, || Ok(self.signature.response_element()))?;
        let message = [FpVar::constant(Purpose::Ownership.tag()), commitment, context];
        enforce_signature(&hasher, &public_key, &nonce_point, &response, &message)
    }
}

/// Transportable ownership proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipProof {
    /// Claimed commitment.
    #[serde(with = "hex_element")]
    pub commitment: Element,
    /// Challenge the proof answers.
    #[serde(with = "hex_element")]
    pub context: Element,
    /// Base64 Groth16 proof.
    pub proof: String,
}

/// Proves that the caller holds `identity`, answering `context`.
pub fn prove_ownership<B: ProofBackend + ?Sized>(
    identity: &Identity,
    context: Element,
    backend: &B,
) -> Result<OwnershipProof, TallyError> {
    let circuit = OwnershipCircuit::new(identity, context)?;
    let commitment = circuit.commitment;
    let proof = backend.prove(circuit.into())?;
    debug!(label = %identity.label, "ownership proved");
    Ok(OwnershipProof {
        commitment,
        context,
        proof: BASE64.encode(proof),
    })
}

impl OwnershipProof {
    /// Checks the proof for `commitment` against the verifier's `context`.
    pub fn verify<B: ProofBackend + ?Sized>(
        &self,
        backend: &B,
        commitment: &Element,
        context: &Element,
    ) -> Result<bool, TallyError> {
        if self.commitment != *commitment || self.context != *context {
            return Ok(false);
        }
        let proof = BASE64
            .decode(&self.proof)
            .map_err(|e| TallyError::Serialization(format!("ownership proof: {e}")))?;
        backend.verify(CircuitShape::Ownership, &[self.commitment, self.context], &proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::test_support::BACKEND;
    use ark_ff::One;

    #[test]
    fn circuit_requires_the_key_behind_the_commitment() {
        let alice = Identity::create("alice", "123456").unwrap();
        let bob = Identity::create("bob", "123456").unwrap();
        let context = Element::from(41u64);
        let honest = OwnershipCircuit::new(&alice, context).unwrap();
        assert!(honest.is_satisfied().unwrap());

        // Bob's key and signature do not open Alice's commitment.
        let mut borrowed = OwnershipCircuit::new(&bob, context).unwrap();
        borrowed.commitment = alice.commitment;
        assert!(!borrowed.is_satisfied().unwrap());

        let mut wrong_pin = honest.clone();
        wrong_pin.pin += Element::one();
        assert!(!wrong_pin.is_satisfied().unwrap());

        let mut stale = honest;
        stale.context = Element::from(42u64);
        assert!(!stale.is_satisfied().unwrap());
    }

    #[test]
    fn proof_verifies_for_its_commitment_and_context() {
        let alice = Identity::create("alice", "605435").unwrap();
        let context = Element::from(7u64);
        let proof = prove_ownership(&alice, context, &*BACKEND).unwrap();
        assert!(proof.verify(&*BACKEND, &alice.commitment, &context).unwrap());
        assert!(!proof.verify(&*BACKEND, &alice.commitment, &Element::from(8u64)).unwrap());

        let mut moved = proof.clone();
        moved.context = Element::from(8u64);
        assert!(!moved.verify(&*BACKEND, &alice.commitment, &moved.context).unwrap());

        let json = serde_json::to_string(&proof).unwrap();
        assert_eq!(serde_json::from_str::<OwnershipProof>(&json).unwrap(), proof);
    }
}
