//! R1CS counterparts of the native hashes, map proofs and signatures.
//!
//! Every gadget here computes the same value as its native twin in
//! [`crate::hash`], [`crate::membership`] or [`crate::keys`]; the tests at the
//! bottom pin that agreement.

use ark_crypto_primitives::crh::poseidon::constraints::{CRHGadget, CRHParametersVar};
use ark_crypto_primitives::crh::CRHSchemeGadget;
use ark_ec::Group;
use ark_ed_on_bn254::{constraints::EdwardsVar, EdwardsProjective};
use ark_r1cs_std::{
    alloc::AllocVar,
    boolean::Boolean,
    eq::EqGadget,
    fields::{fp::FpVar, FieldVar},
    groups::CurveVar,
    ToBitsGadget,
};
use ark_relations::r1cs::{ConstraintSystemRef, SynthesisError};

use crate::encoding::Element;
use crate::hash::{poseidon_config, Domain};
use crate::membership::Leaf;

/// Field element variable.
pub type ElementVar = FpVar<Element>;

/// Baby Jubjub point variable.
pub type PointVar = EdwardsVar;

/// Poseidon hashing inside a circuit.
#[derive(Clone)]
pub struct HashGadget {
    params: CRHParametersVar<Element>,
}

impl Default for HashGadget {
    fn default() -> Self {
        Self::new()
    }
}

impl HashGadget {
    /// Loads the shared permutation parameters as constants.
    pub fn new() -> Self {
        Self {
            params: CRHParametersVar {
                parameters: poseidon_config().clone(),
            },
        }
    }

    fn sponge(&self, domain: Domain, inputs: &[ElementVar]) -> Result<ElementVar, SynthesisError> {
        let mut absorbed = Vec::with_capacity(inputs.len() + 1);
        absorbed.push(FpVar::constant(domain.tag()));
        absorbed.extend_from_slice(inputs);
        CRHGadget::<Element>::evaluate(&self.params, absorbed.as_slice())
    }

    /// Mirrors [`crate::hash::hash_elements`].
    pub fn hash_elements(&self, inputs: &[ElementVar]) -> Result<ElementVar, SynthesisError> {
        let mut prefixed = Vec::with_capacity(inputs.len() + 1);
        prefixed.push(FpVar::constant(Element::from(inputs.len() as u64)));
        prefixed.extend_from_slice(inputs);
        self.sponge(Domain::Elements, &prefixed)
    }

    /// Mirrors [`crate::hash::hash_leaf`].
    pub fn hash_leaf(
        &self,
        key: &ElementVar,
        next_key: &ElementVar,
        value: &ElementVar,
    ) -> Result<ElementVar, SynthesisError> {
        self.sponge(Domain::Leaf, &[key.clone(), next_key.clone(), value.clone()])
    }

    /// Mirrors [`crate::hash::hash_pair`].
    pub fn hash_pair(&self, left: &ElementVar, right: &ElementVar) -> Result<ElementVar, SynthesisError> {
        self.sponge(Domain::Node, &[left.clone(), right.clone()])
    }

    /// Mirrors [`crate::hash::hash_challenge`].
    pub fn hash_challenge(&self, inputs: &[ElementVar]) -> Result<ElementVar, SynthesisError> {
        self.sponge(Domain::Challenge, inputs)
    }
}

/// `a < b` on canonical representatives, over the whole field.
pub fn is_less_than(a: &ElementVar, b: &ElementVar) -> Result<Boolean<Element>, SynthesisError> {
    let a_bits = a.to_bits_le()?;
    let b_bits = b.to_bits_le()?;
    let mut less = Boolean::FALSE;
    // Scanning upwards, the highest differing bit decides.
    for (a_bit, b_bit) in a_bits.iter().zip(&b_bits) {
        let below = a_bit.not().and(b_bit)?;
        let tied = a_bit.xor(b_bit)?.not();
        less = below.or(&tied.and(&less)?)?;
    }
    Ok(less)
}

/// A map leaf with its authentication path, allocated as witnesses.
pub struct LeafPathVar {
    /// Leaf key.
    pub key: ElementVar,
    /// Next larger key, zero for the last leaf.
    pub next_key: ElementVar,
    /// Leaf value.
    pub value: ElementVar,
    directions: Vec<Boolean<Element>>,
    siblings: Vec<ElementVar>,
}

impl LeafPathVar {
    /// Allocates `leaf` and a path of exactly `depth` siblings.
    pub fn new_witness(
        cs: ConstraintSystemRef<Element>,
        leaf: &Leaf,
        siblings: &[Element],
        depth: usize,
    ) -> Result<Self, SynthesisError> {
        if siblings.len() != depth {
            return Err(SynthesisError::Unsatisfiable);
        }
        let directions = (0..depth)
            .map(|level| Boolean::new_witness(cs.clone(), || Ok((leaf.index >> level) & 1 == 1)))
            .collect::<Result<Vec<_>, _>>()?;
        let siblings = siblings
            .iter()
            .map(|sibling| FpVar::new_witness(cs.clone(), || Ok(*sibling)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            key: FpVar::new_witness(cs.clone(), || Ok(leaf.key))?,
            next_key: FpVar::new_witness(cs.clone(), || Ok(leaf.next_key))?,
            value: FpVar::new_witness(cs, || Ok(leaf.value))?,
            directions,
            siblings,
        })
    }

    /// Root reached by hashing the leaf up its path.
    pub fn root(&self, hasher: &HashGadget) -> Result<ElementVar, SynthesisError> {
        let mut current = hasher.hash_leaf(&self.key, &self.next_key, &self.value)?;
        for (is_right, sibling) in self.directions.iter().zip(&self.siblings) {
            let left = is_right.select(sibling, &current)?;
            let right = is_right.select(&current, sibling)?;
            current = hasher.hash_pair(&left, &right)?;
        }
        Ok(current)
    }

    /// Enforces that this leaf holds `key` under `root`.
    pub fn enforce_includes(
        &self,
        hasher: &HashGadget,
        key: &ElementVar,
        root: &ElementVar,
    ) -> Result<(), SynthesisError> {
        self.key.enforce_equal(key)?;
        self.root(hasher)?.enforce_equal(root)
    }

    /// Enforces that this leaf brackets the absent `key` under `root`.
    pub fn enforce_excludes(
        &self,
        hasher: &HashGadget,
        key: &ElementVar,
        root: &ElementVar,
    ) -> Result<(), SynthesisError> {
        self.root(hasher)?.enforce_equal(root)?;
        is_less_than(&self.key, key)?.enforce_equal(&Boolean::TRUE)?;
        let is_last = self.next_key.is_zero()?;
        let below_next = is_less_than(key, &self.next_key)?;
        is_last.or(&below_next)?.enforce_equal(&Boolean::TRUE)
    }
}

/// Enforces `s·G = R + e·pk` with `e = hash_challenge(R, pk, message)`.
pub fn enforce_signature(
    hasher: &HashGadget,
    public_key: &PointVar,
    nonce_point: &PointVar,
    response: &ElementVar,
    message: &[ElementVar],
) -> Result<(), SynthesisError> {
    let mut inputs = vec![
        nonce_point.x.clone(),
        nonce_point.y.clone(),
        public_key.x.clone(),
        public_key.y.clone(),
    ];
    inputs.extend_from_slice(message);
    let challenge = hasher.hash_challenge(&inputs)?;

    let generator = PointVar::constant(EdwardsProjective::generator());
    let lhs = generator.scalar_mul_le(response.to_bits_le()?.iter())?;
    let rhs = nonce_point + &public_key.scalar_mul_le(challenge.to_bits_le()?.iter())?;
    lhs.enforce_equal(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_challenge, hash_elements, hash_pair};
    use crate::keys::{Purpose, SecretKey};
    use crate::membership::{MembershipMap, Tier};
    use ark_r1cs_std::R1CSVar;
    use ark_relations::r1cs::ConstraintSystem;
    use rand::rngs::OsRng;

    fn e(n: u64) -> Element {
        Element::from(n)
    }

    fn witness(cs: &ConstraintSystemRef<Element>, value: Element) -> ElementVar {
        FpVar::new_witness(cs.clone(), || Ok(value)).unwrap()
    }

    #[test]
    fn hashes_match_native() {
        let cs = ConstraintSystem::<Element>::new_ref();
        let hasher = HashGadget::new();
        let (a, b, c) = (e(11), e(22), e(33));
        let vars = [witness(&cs, a), witness(&cs, b), witness(&cs, c)];
        assert_eq!(hasher.hash_elements(&vars).unwrap().value().unwrap(), hash_elements(&[a, b, c]));
        assert_eq!(hasher.hash_pair(&vars[0], &vars[1]).unwrap().value().unwrap(), hash_pair(&a, &b));
        assert_eq!(hasher.hash_challenge(&vars).unwrap().value().unwrap(), hash_challenge(&[a, b, c]));
        assert!(cs.is_satisfied().unwrap());
    }

    #[test]
    fn comparison_covers_the_full_field() {
        let cs = ConstraintSystem::<Element>::new_ref();
        let high = -e(5);
        let cases = [(e(1), e(2), true), (e(2), e(1), false), (e(7), e(7), false), (e(3), high, true), (high, e(3), false)];
        for (a, b, expected) in cases {
            let less = is_less_than(&witness(&cs, a), &witness(&cs, b)).unwrap();
            assert_eq!(less.value().unwrap(), expected);
        }
        assert!(cs.is_satisfied().unwrap());
    }

    fn map() -> MembershipMap {
        let mut map = MembershipMap::new(Tier::Small);
        for key in [10u64, 30, 50] {
            map.insert(e(key), e(1)).unwrap();
        }
        map
    }

    #[test]
    fn inclusion_path_reaches_root() {
        let map = map();
        let proof = map.prove_included(&e(30)).unwrap();
        let cs = ConstraintSystem::<Element>::new_ref();
        let hasher = HashGadget::new();
        let path = LeafPathVar::new_witness(cs.clone(), &proof.leaf, &proof.siblings, Tier::Small.depth()).unwrap();
        let root = witness(&cs, map.root());
        path.enforce_includes(&hasher, &witness(&cs, e(30)), &root).unwrap();
        assert!(cs.is_satisfied().unwrap());

        let wrong_key = ConstraintSystem::<Element>::new_ref();
        let path = LeafPathVar::new_witness(wrong_key.clone(), &proof.leaf, &proof.siblings, Tier::Small.depth()).unwrap();
        let root = witness(&wrong_key, map.root());
        path.enforce_includes(&hasher, &witness(&wrong_key, e(31)), &root).unwrap();
        assert!(!wrong_key.is_satisfied().unwrap());
    }

    #[test]
    fn exclusion_requires_a_bracketing_low_leaf() {
        let map = map();
        let hasher = HashGadget::new();
        let check = |absent: u64, low_of: u64| {
            let proof = map.prove_excluded(&e(low_of)).unwrap();
            let cs = ConstraintSystem::<Element>::new_ref();
            let path =
                LeafPathVar::new_witness(cs.clone(), &proof.low_leaf, &proof.siblings, Tier::Small.depth()).unwrap();
            let root = witness(&cs, map.root());
            path.enforce_excludes(&hasher, &witness(&cs, e(absent)), &root).unwrap();
            cs.is_satisfied().unwrap()
        };
        assert!(check(20, 20));
        assert!(check(7001, 7001));
        // Low leaf 10 does not bracket 40 or the present key 30.
        assert!(!check(40, 20));
        assert!(!check(30, 20));
    }

    #[test]
    fn signature_gadget_agrees_with_native_check() {
        let sk = SecretKey::generate(&mut OsRng);
        let pk = sk.public_key();
        let message = Purpose::Signal.message(&e(5), &e(6));
        let signature = sk.sign(&message);
        let hasher = HashGadget::new();

        let run = |signed: &[Element]| {
            let cs = ConstraintSystem::<Element>::new_ref();
            let pk_var = PointVar::new_witness(cs.clone(), || Ok(*pk.point())).unwrap();
            let nonce = PointVar::new_witness(cs.clone(), || Ok(signature.nonce_point)).unwrap();
            let response = witness(&cs, signature.response_element());
            let message: Vec<ElementVar> = signed.iter().map(|m| witness(&cs, *m)).collect();
            enforce_signature(&hasher, &pk_var, &nonce, &response, &message).unwrap();
            cs.is_satisfied().unwrap()
        };
        assert!(run(&message));
        assert!(!run(&Purpose::Signal.message(&e(5), &e(7))));
    }
}
