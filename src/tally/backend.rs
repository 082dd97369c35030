//! Proof backend seam and the Groth16 implementation.
//!
//! Keys are generated per circuit shape from a seeded `StdRng`, so every
//! party configured with the same setup seed derives the same verifying keys.
//! Rollup shapes depend on the member and claim map tiers and are generated
//! on first use.

use ark_bn254::{Bn254, Fr};
use ark_groth16::r1cs_to_qap::LibsnarkReduction;
use ark_groth16::{prepare_verifying_key, Groth16, PreparedVerifyingKey, Proof, ProvingKey};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::circuit::{satisfied, RollupEvidence, Transition, TransitionCircuit};
use super::TallyError;
use crate::encoding::Element;
use crate::membership::Tier;
use crate::ownership::OwnershipCircuit;

/// Default setup seed.
pub const DEFAULT_SETUP_SEED: u64 = 0x636c_6169_6d5f_7461;

/// Which key set a proof belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitShape {
    /// Genesis transition.
    Init,
    /// Rollup transition over maps of the given tiers.
    Rollup {
        /// Tier of the validators and auditors maps.
        members: Tier,
        /// Tier of the claim electors and nullifiers maps.
        claim: Tier,
    },
    /// Final transition.
    Final,
    /// Identity ownership.
    Ownership,
}

impl fmt::Display for CircuitShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitShape::Init => f.write_str("init"),
            CircuitShape::Rollup { members, claim } => write!(f, "rollup-{members}-{claim}"),
            CircuitShape::Final => f.write_str("final"),
            CircuitShape::Ownership => f.write_str("ownership"),
        }
    }
}

/// Any circuit the backend proves.
#[derive(Debug, Clone)]
pub enum Circuit {
    /// A tally transition.
    Transition(TransitionCircuit),
    /// An identity ownership proof.
    Ownership(OwnershipCircuit),
}

impl Circuit {
    /// Placeholder assignment of `shape`, for key generation.
    pub fn blank(shape: CircuitShape) -> Self {
        match shape {
            CircuitShape::Init => TransitionCircuit::blank(Transition::Init).into(),
            CircuitShape::Rollup { members, claim } => {
                TransitionCircuit::blank(Transition::Rollup(Box::new(RollupEvidence::blank(members, claim)))).into()
            }
            CircuitShape::Final => TransitionCircuit::blank(Transition::Final).into(),
            CircuitShape::Ownership => OwnershipCircuit::blank().into(),
        }
    }

    /// Key set the circuit is proved under.
    pub fn shape(&self) -> CircuitShape {
        match self {
            Circuit::Transition(circuit) => circuit.shape(),
            Circuit::Ownership(_) => CircuitShape::Ownership,
        }
    }

    /// Public inputs in verifier order.
    pub fn public_inputs(&self) -> Vec<Element> {
        match self {
            Circuit::Transition(circuit) => circuit.public_inputs(),
            Circuit::Ownership(circuit) => circuit.public_inputs(),
        }
    }
}

impl From<TransitionCircuit> for Circuit {
    fn from(circuit: TransitionCircuit) -> Self {
        Circuit::Transition(circuit)
    }
}

impl From<OwnershipCircuit> for Circuit {
    fn from(circuit: OwnershipCircuit) -> Self {
        Circuit::Ownership(circuit)
    }
}

impl ConstraintSynthesizer<Fr> for Circuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        match self {
            Circuit::Transition(circuit) => circuit.generate_constraints(cs),
            Circuit::Ownership(circuit) => circuit.generate_constraints(cs),
        }
    }
}

/// Proves and verifies circuits.
pub trait ProofBackend: Send + Sync {
    /// Produces serialized proof bytes for a satisfied assignment.
    fn prove(&self, circuit: Circuit) -> Result<Vec<u8>, TallyError>;

    /// Checks serialized proof bytes against public inputs for `shape`.
    fn verify(&self, shape: CircuitShape, public_inputs: &[Element], proof: &[u8]) -> Result<bool, TallyError>;
}

impl<B: ProofBackend + ?Sized> ProofBackend for &B {
    fn prove(&self, circuit: Circuit) -> Result<Vec<u8>, TallyError> {
        (**self).prove(circuit)
    }

    fn verify(&self, shape: CircuitShape, public_inputs: &[Element], proof: &[u8]) -> Result<bool, TallyError> {
        (**self).verify(shape, public_inputs, proof)
    }
}

impl<B: ProofBackend + ?Sized> ProofBackend for Arc<B> {
    fn prove(&self, circuit: Circuit) -> Result<Vec<u8>, TallyError> {
        (**self).prove(circuit)
    }

    fn verify(&self, shape: CircuitShape, public_inputs: &[Element], proof: &[u8]) -> Result<bool, TallyError> {
        (**self).verify(shape, public_inputs, proof)
    }
}

struct CircuitKeys {
    proving: ProvingKey<Bn254>,
    verifying: PreparedVerifyingKey<Bn254>,
}

/// Groth16 over BN254 with one key pair per circuit shape.
pub struct Groth16Backend {
    seed: u64,
    keys: Mutex<HashMap<CircuitShape, Arc<CircuitKeys>>>,
}

fn shape_rng(seed: u64, shape: CircuitShape) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(b"CLAIM_TALLY_SETUP");
    hasher.update(seed.to_le_bytes());
    hasher.update(shape.to_string().as_bytes());
    StdRng::from_seed(hasher.finalize().into())
}

fn setup_shape(seed: u64, shape: CircuitShape) -> Result<CircuitKeys, TallyError> {
    debug!(seed, %shape, "generating circuit keys");
    let mut rng = shape_rng(seed, shape);
    let proving = Groth16::<Bn254, LibsnarkReduction>::generate_random_parameters_with_reduction(
        Circuit::blank(shape),
        &mut rng,
    )
    .map_err(|e| TallyError::Prover(format!("{shape} parameter gen failed: {e}")))?;
    let verifying = prepare_verifying_key(&proving.vk);
    Ok(CircuitKeys { proving, verifying })
}

impl Groth16Backend {
    /// Generates the `init` and `final` keys from `seed`; other shapes follow on demand.
    pub fn setup(seed: u64) -> Result<Self, TallyError> {
        let backend = Self {
            seed,
            keys: Mutex::new(HashMap::new()),
        };
        backend.keys(CircuitShape::Init)?;
        backend.keys(CircuitShape::Final)?;
        Ok(backend)
    }

    /// Seed the keys were derived from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn keys(&self, shape: CircuitShape) -> Result<Arc<CircuitKeys>, TallyError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| TallyError::Prover("key cache poisoned".into()))?;
        if let Some(found) = keys.get(&shape) {
            return Ok(Arc::clone(found));
        }
        let generated = Arc::new(setup_shape(self.seed, shape)?);
        keys.insert(shape, Arc::clone(&generated));
        Ok(generated)
    }

    /// Compressed verifying key for `shape`.
    pub fn verifying_key_bytes(&self, shape: CircuitShape) -> Result<Vec<u8>, TallyError> {
        let mut out = Vec::new();
        self.keys(shape)?
            .proving
            .vk
            .serialize_compressed(&mut out)
            .map_err(|e| TallyError::Serialization(e.to_string()))?;
        Ok(out)
    }
}

impl ProofBackend for Groth16Backend {
    fn prove(&self, circuit: Circuit) -> Result<Vec<u8>, TallyError> {
        let shape = circuit.shape();
        let is_satisfied =
            satisfied(circuit.clone()).map_err(|e| TallyError::Prover(format!("{shape} synthesis failed: {e}")))?;
        if !is_satisfied {
            return Err(TallyError::Prover(format!("{shape} assignment is not satisfied")));
        }
        let keys = self.keys(shape)?;
        let mut rng = StdRng::from_entropy();
        let proof =
            Groth16::<Bn254, LibsnarkReduction>::create_random_proof_with_reduction(circuit, &keys.proving, &mut rng)
                .map_err(|e| TallyError::Prover(format!("{shape} proof gen failed: {e}")))?;
        let mut out = Vec::new();
        proof
            .serialize_compressed(&mut out)
            .map_err(|e| TallyError::Serialization(e.to_string()))?;
        Ok(out)
    }

    fn verify(&self, shape: CircuitShape, public_inputs: &[Element], proof: &[u8]) -> Result<bool, TallyError> {
        let proof = match Proof::<Bn254>::deserialize_compressed(proof) {
            Ok(proof) => proof,
            Err(_) => return Ok(false),
        };
        let keys = self.keys(shape)?;
        if public_inputs.len() + 1 != keys.verifying.vk.gamma_abc_g1.len() {
            return Ok(false);
        }
        Groth16::<Bn254, LibsnarkReduction>::verify_proof(&keys.verifying, &proof, public_inputs)
            .map_err(|e| TallyError::Prover(format!("{shape} verification failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::state::ClaimState;
    use crate::tally::test_support::BACKEND;

    fn genesis_circuit(required_votes: u64) -> TransitionCircuit {
        let state = ClaimState::new(Element::from(7u64), required_votes, 1).to_elements();
        TransitionCircuit {
            transition: Transition::Init,
            input: state,
            output: state,
            binding: Element::from(3u64),
        }
    }

    #[test]
    fn proof_verifies_for_its_public_inputs_only() {
        let circuit = genesis_circuit(2);
        let inputs = circuit.public_inputs();
        let proof = BACKEND.prove(circuit.into()).unwrap();
        assert!(BACKEND.verify(CircuitShape::Init, &inputs, &proof).unwrap());

        let mut tampered = inputs.clone();
        tampered[16] = Element::from(4u64);
        assert!(!BACKEND.verify(CircuitShape::Init, &tampered, &proof).unwrap());
        assert!(!BACKEND.verify(CircuitShape::Final, &inputs, &proof).unwrap());
        assert!(!BACKEND.verify(CircuitShape::Init, &inputs[1..], &proof).unwrap());
        assert!(!BACKEND.verify(CircuitShape::Init, &inputs, &proof[1..]).unwrap());
    }

    #[test]
    fn unsatisfied_assignments_are_refused() {
        // Fewer required votes than required positives.
        let circuit = genesis_circuit(0);
        assert!(matches!(BACKEND.prove(circuit.into()), Err(TallyError::Prover(_))));
    }

    #[test]
    fn keys_are_deterministic_per_seed() {
        let again = Groth16Backend::setup(BACKEND.seed()).unwrap();
        assert_eq!(
            again.verifying_key_bytes(CircuitShape::Final).unwrap(),
            BACKEND.verifying_key_bytes(CircuitShape::Final).unwrap()
        );
        let other = Groth16Backend::setup(BACKEND.seed() + 1).unwrap();
        assert_ne!(
            other.verifying_key_bytes(CircuitShape::Init).unwrap(),
            BACKEND.verifying_key_bytes(CircuitShape::Init).unwrap()
        );
    }
}
