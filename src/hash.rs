//! Poseidon hashing of field elements.
//!
//! Every digest a tally circuit has to recompute (commitments, nullifiers,
//! vote signals, map leaves and nodes, signature challenges) is a Poseidon
//! sponge over BN254 scalars.  Each input is prefixed with a domain tag, and
//! variable-length inputs also carry their length.  [`crate::gadgets`] mirrors
//! every function here in R1CS.

use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::{PrimeField, Zero};
use once_cell::sync::Lazy;

use crate::encoding::{bytes_to_elements, Element};

/// Full S-box rounds of the permutation.
pub const FULL_ROUNDS: usize = 8;
/// Partial S-box rounds of the permutation.
pub const PARTIAL_ROUNDS: usize = 60;
/// S-box exponent.
pub const ALPHA: u64 = 5;
/// Elements absorbed per permutation.
pub const RATE: usize = 4;

/// Deepest supported Merkle tree.
pub const MAX_DEPTH: usize = 24;

/// Separates the hash uses from one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Length-prefixed element lists.
    Elements,
    /// Indexed-map leaves.
    Leaf,
    /// Merkle nodes.
    Node,
    /// Schnorr challenges.
    Challenge,
}

impl Domain {
    const fn label(self) -> &'static [u8] {
        match self {
            Domain::Elements => b"CLAIM_TALLY_HASH",
            Domain::Leaf => b"CLAIM_TALLY_LEAF",
            Domain::Node => b"CLAIM_TALLY_NODE",
            Domain::Challenge => b"CLAIM_TALLY_CHAL",
        }
    }

    /// Element absorbed ahead of the inputs.
    pub fn tag(self) -> Element {
        Element::from_le_bytes_mod_order(self.label())
    }
}

static POSEIDON: Lazy<PoseidonConfig<Element>> = Lazy::new(|| {
    let (ark, mds) = find_poseidon_ark_and_mds::<Element>(
        Element::MODULUS_BIT_SIZE as u64,
        RATE,
        FULL_ROUNDS as u64,
        PARTIAL_ROUNDS as u64,
        0,
    );
    PoseidonConfig::new(FULL_ROUNDS, PARTIAL_ROUNDS, ALPHA, mds, ark, RATE, 1)
});

/// Permutation parameters shared by native hashing and the circuits.
pub fn poseidon_config() -> &'static PoseidonConfig<Element> {
    &POSEIDON
}

fn sponge(domain: Domain, inputs: &[Element]) -> Element {
    let mut absorbed = Vec::with_capacity(inputs.len() + 1);
    absorbed.push(domain.tag());
    absorbed.extend_from_slice(inputs);
    let mut sponge = PoseidonSponge::new(&POSEIDON);
    sponge.absorb(&absorbed);
    sponge.squeeze_field_elements::<Element>(1)[0]
}

/// Hashes an ordered list of elements.
pub fn hash_elements(inputs: &[Element]) -> Element {
    let mut prefixed = Vec::with_capacity(inputs.len() + 1);
    prefixed.push(Element::from(inputs.len() as u64));
    prefixed.extend_from_slice(inputs);
    sponge(Domain::Elements, &prefixed)
}

/// Hashes a byte string: its length, then 31-byte little-endian chunks.
pub fn hash_bytes(bytes: &[u8]) -> Element {
    let mut fields = vec![Element::from(bytes.len() as u64)];
    fields.extend(bytes_to_elements(bytes));
    hash_elements(&fields)
}

/// Hashes an indexed-map leaf `(key, next_key, value)`.
pub fn hash_leaf(key: &Element, next_key: &Element, value: &Element) -> Element {
    sponge(Domain::Leaf, &[*key, *next_key, *value])
}

/// Hashes two sibling Merkle nodes.
pub fn hash_pair(left: &Element, right: &Element) -> Element {
    sponge(Domain::Node, &[*left, *right])
}

/// Hashes the fixed-length input of a signature challenge.
pub fn hash_challenge(inputs: &[Element]) -> Element {
    sponge(Domain::Challenge, inputs)
}

static EMPTY_NODES: Lazy<Vec<Element>> = Lazy::new(|| {
    let mut nodes = Vec::with_capacity(MAX_DEPTH + 1);
    nodes.push(Element::zero());
    for level in 0..MAX_DEPTH {
        let below = nodes[level];
        nodes.push(hash_pair(&below, &below));
    }
    nodes
});

/// Returns the root of an empty subtree of the given height.
pub fn empty_node(level: usize) -> Element {
    EMPTY_NODES[level]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_crypto_primitives::crh::{poseidon::CRH, CRHScheme};

    #[test]
    fn domains_are_separated() {
        let a = Element::from(1u64);
        let b = Element::from(2u64);
        let c = Element::from(3u64);
        assert_ne!(hash_elements(&[a, b, c]), hash_leaf(&a, &b, &c));
        assert_ne!(hash_elements(&[a, b]), hash_pair(&a, &b));
        assert_ne!(hash_challenge(&[a, b]), hash_pair(&a, &b));
    }

    #[test]
    fn length_prefix_distinguishes_trailing_zeros() {
        let one = Element::from(1u64);
        assert_ne!(
            hash_elements(&[one]),
            hash_elements(&[one, Element::zero()])
        );
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"a\0"));
    }

    #[test]
    fn sponge_is_the_poseidon_crh() {
        let (left, right) = (Element::from(10u64), Element::from(20u64));
        let input = [Domain::Node.tag(), left, right];
        assert_eq!(
            CRH::<Element>::evaluate(poseidon_config(), input.as_slice()).unwrap(),
            hash_pair(&left, &right)
        );
    }

    #[test]
    fn empty_nodes_chain() {
        assert_eq!(empty_node(0), Element::zero());
        assert_eq!(empty_node(3), hash_pair(&empty_node(2), &empty_node(2)));
    }

    #[test]
    fn byte_hash_is_deterministic() {
        assert_eq!(hash_bytes(b"+1"), hash_bytes(b"+1"));
        assert_ne!(hash_bytes(b"+1"), hash_bytes(b"-1"));
    }
}
