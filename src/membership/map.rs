//! Indexed authenticated map.
//!
//! Keys are kept in a sorted linked list embedded in the leaves of a
//! fixed-depth binary Merkle tree: every leaf stores `(key, nextKey, value)`
//! and its tree `index`.  Leaves are appended at `index = length`, so each tree
//! level is a dense prefix and the node table only holds non-empty nodes;
//! everything to the right is an empty subtree whose root is precomputed.
//!
//! * **Inclusion** of `k` is the Merkle path of the leaf whose key is `k`.
//! * **Exclusion** of `k` is the Merkle path of the *low leaf* `l` with
//!   `l.key < k < l.nextKey` (or `l.nextKey = 0` when `l` is the last key).
//!
//! Key `0` is a sentinel leaf present from construction; it anchors the list
//! and is never enumerated or mutated.

use ark_ff::Zero;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::encoding::{element_from_compact, element_to_compact, Element, EncodingError};
use crate::hash::{empty_node, hash_leaf, hash_pair};

/// Errors raised by map mutation, proof generation and restoration.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("key already present")]
    /// `insert` on an existing key.
    KeyExists,
    #[error("key not present")]
    /// `update`, `get` or an inclusion proof on a missing key.
    NotIncluded,
    #[error("key is present")]
    /// Exclusion proof requested for a present key.
    Included,
    #[error("map is full (capacity {capacity})")]
    /// Tier capacity exhausted.
    Full {
        /// Maximum number of leaves for the tier.
        capacity: u64,
    },
    #[error("key 0 is reserved")]
    /// Mutation attempted on the sentinel key.
    ReservedKey,
    #[error("unknown map tier: {0}")]
    /// Tier name not recognised.
    UnknownTier(String),
    #[error("corrupt map state: {0}")]
    /// Serialized state is inconsistent or a proof failed to reproduce the root.
    Corrupt(String),
    #[error(transparent)]
    /// Element text could not be decoded.
    Encoding(#[from] EncodingError),
    #[error("map JSON error: {0}")]
    /// Serialized JSON was malformed.
    Json(#[from] serde_json::Error),
}

/// Capacity tier of a map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Depth 12, up to 4096 leaves.
    #[default]
    Small,
    /// Depth 16, up to 65536 leaves.
    Medium,
    /// Depth 24, up to 16777216 leaves.
    Big,
}

impl Tier {
    /// Tree depth for the tier.
    pub const fn depth(self) -> usize {
        match self {
            Tier::Small => 12,
            Tier::Medium => 16,
            Tier::Big => 24,
        }
    }

    /// Maximum number of leaves, sentinel included.
    pub const fn capacity(self) -> u64 {
        1u64 << self.depth()
    }

    /// Lowercase tier name.
    pub const fn name(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Big => "big",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "big" => Ok(Tier::Big),
            other => Err(MapError::UnknownTier(other.to_string())),
        }
    }
}

/// A leaf of the indexed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leaf {
    /// Leaf key.
    pub key: Element,
    /// Next larger key, or zero for the largest key.
    pub next_key: Element,
    /// Stored value.
    pub value: Element,
    /// Position of the leaf in the tree.
    pub index: u64,
}

impl Leaf {
    /// Merkle hash of the leaf.
    pub fn hash(&self) -> Element {
        hash_leaf(&self.key, &self.next_key, &self.value)
    }

    /// True when `key` falls strictly inside the gap after this leaf.
    pub fn brackets(&self, key: &Element) -> bool {
        self.key < *key && (self.next_key.is_zero() || *key < self.next_key)
    }
}

fn root_from_path(leaf: &Leaf, siblings: &[Element]) -> Element {
    let mut index = leaf.index;
    let mut current = leaf.hash();
    for sibling in siblings {
        current = if index & 1 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        index >>= 1;
    }
    current
}

/// Evidence that a key is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    /// Leaf holding the key.
    pub leaf: Leaf,
    /// Sibling hashes from the leaf level upwards.
    pub siblings: Vec<Element>,
}

impl InclusionProof {
    /// Checks the proof for `key` against `root`.
    pub fn verify(&self, root: &Element, key: &Element) -> bool {
        self.leaf.key == *key && root_from_path(&self.leaf, &self.siblings) == *root
    }
}

/// Evidence that a key is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionProof {
    /// Leaf whose gap contains the key.
    pub low_leaf: Leaf,
    /// Sibling hashes from the leaf level upwards.
    pub siblings: Vec<Element>,
}

impl ExclusionProof {
    /// Checks the proof for `key` against `root`.
    pub fn verify(&self, root: &Element, key: &Element) -> bool {
        self.low_leaf.brackets(key) && root_from_path(&self.low_leaf, &self.siblings) == *root
    }
}

/// Indexed Merkle map of a fixed tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipMap {
    tier: Tier,
    root: Element,
    length: u64,
    sorted_leaves: Vec<Leaf>,
    nodes: Vec<Vec<Element>>,
}

impl MembershipMap {
    /// Creates a map holding only the sentinel leaf.
    pub fn new(tier: Tier) -> Self {
        let sentinel = Leaf {
            key: Element::zero(),
            next_key: Element::zero(),
            value: Element::zero(),
            index: 0,
        };
        let mut map = Self {
            tier,
            root: empty_node(tier.depth()),
            length: 1,
            sorted_leaves: vec![sentinel],
            nodes: vec![Vec::new(); tier.depth() + 1],
        };
        map.write_leaf(&sentinel);
        map
    }

    /// Capacity tier.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Current Merkle root.
    pub fn root(&self) -> Element {
        self.root
    }

    /// Number of leaves including the sentinel.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Number of real entries.
    pub fn len(&self) -> usize {
        self.sorted_leaves.len() - 1
    }

    /// True when only the sentinel is present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaves in ascending key order, sentinel first.
    pub fn leaves(&self) -> &[Leaf] {
        &self.sorted_leaves
    }

    /// Ascending keys, sentinel excluded.
    pub fn sorted_keys(&self) -> Vec<Element> {
        self.sorted_leaves
            .iter()
            .filter(|leaf| !leaf.key.is_zero())
            .map(|leaf| leaf.key)
            .collect()
    }

    fn find(&self, key: &Element) -> Result<usize, usize> {
        self.sorted_leaves.binary_search_by(|leaf| leaf.key.cmp(key))
    }

    /// Value stored under `key`, if any.
    pub fn get_option(&self, key: &Element) -> Option<Element> {
        if key.is_zero() {
            return None;
        }
        self.find(key).ok().map(|pos| self.sorted_leaves[pos].value)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &Element) -> Result<Element, MapError> {
        self.get_option(key).ok_or(MapError::NotIncluded)
    }

    /// True when `key` is a real entry.
    pub fn contains(&self, key: &Element) -> bool {
        self.get_option(key).is_some()
    }

    /// Adds a new key; fails if it already exists.
    pub fn insert(&mut self, key: Element, value: Element) -> Result<(), MapError> {
        if key.is_zero() {
            return Err(MapError::ReservedKey);
        }
        let pos = match self.find(&key) {
            Ok(_) => return Err(MapError::KeyExists),
            Err(pos) => pos,
        };
        if self.length >= self.tier.capacity() {
            return Err(MapError::Full {
                capacity: self.tier.capacity(),
            });
        }
        // pos >= 1 because the sentinel key 0 sorts before every real key.
        let low = &mut self.sorted_leaves[pos - 1];
        let leaf = Leaf {
            key,
            next_key: low.next_key,
            value,
            index: self.length,
        };
        low.next_key = key;
        let low = *low;
        self.write_leaf(&low);
        self.sorted_leaves.insert(pos, leaf);
        self.write_leaf(&leaf);
        self.length += 1;
        Ok(())
    }

    /// Replaces the value of an existing key, returning the previous value.
    pub fn update(&mut self, key: Element, value: Element) -> Result<Element, MapError> {
        if key.is_zero() {
            return Err(MapError::ReservedKey);
        }
        let pos = self.find(&key).map_err(|_| MapError::NotIncluded)?;
        let leaf = &mut self.sorted_leaves[pos];
        let previous = leaf.value;
        leaf.value = value;
        let leaf = *leaf;
        self.write_leaf(&leaf);
        Ok(previous)
    }

    /// Inserts or updates; returns the previous value when the key existed.
    pub fn set(&mut self, key: Element, value: Element) -> Result<Option<Element>, MapError> {
        if self.contains(&key) {
            self.update(key, value).map(Some)
        } else {
            self.insert(key, value).map(|_| None)
        }
    }

    /// Builds an inclusion proof for `key`.
    pub fn prove_included(&self, key: &Element) -> Result<InclusionProof, MapError> {
        let pos = self.find(key).map_err(|_| MapError::NotIncluded)?;
        let leaf = self.sorted_leaves[pos];
        Ok(InclusionProof {
            siblings: self.siblings(leaf.index),
            leaf,
        })
    }

    /// Builds an exclusion proof for `key`.
    pub fn prove_excluded(&self, key: &Element) -> Result<ExclusionProof, MapError> {
        let pos = match self.find(key) {
            Ok(_) => return Err(MapError::Included),
            Err(pos) => pos,
        };
        let low_leaf = self.sorted_leaves[pos - 1];
        Ok(ExclusionProof {
            siblings: self.siblings(low_leaf.index),
            low_leaf,
        })
    }

    /// Proves and checks that `key` is present under the current root.
    pub fn assert_included(&self, key: &Element) -> Result<(), MapError> {
        if key.is_zero() {
            return Err(MapError::NotIncluded);
        }
        let proof = self.prove_included(key)?;
        if !proof.verify(&self.root, key) {
            return Err(MapError::Corrupt("inclusion path does not reach root".into()));
        }
        Ok(())
    }

    /// Proves and checks that `key` is absent under the current root.
    pub fn assert_not_included(&self, key: &Element) -> Result<(), MapError> {
        let proof = self.prove_excluded(key)?;
        if !proof.verify(&self.root, key) {
            return Err(MapError::Corrupt("exclusion path does not reach root".into()));
        }
        Ok(())
    }

    fn node(&self, level: usize, index: u64) -> Element {
        self.nodes[level]
            .get(index as usize)
            .copied()
            .unwrap_or_else(|| empty_node(level))
    }

    fn set_node(&mut self, level: usize, index: u64, value: Element) {
        let row = &mut self.nodes[level];
        let index = index as usize;
        match index.cmp(&row.len()) {
            Ordering::Less => row[index] = value,
            Ordering::Equal => row.push(value),
            Ordering::Greater => {
                row.resize(index, empty_node(level));
                row.push(value);
            }
        }
    }

    fn write_leaf(&mut self, leaf: &Leaf) {
        let mut index = leaf.index;
        self.set_node(0, index, leaf.hash());
        for level in 0..self.tier.depth() {
            let parent = index >> 1;
            let left = self.node(level, parent << 1);
            let right = self.node(level, (parent << 1) | 1);
            self.set_node(level + 1, parent, hash_pair(&left, &right));
            index = parent;
        }
        self.root = self.node(self.tier.depth(), 0);
    }

    fn siblings(&self, index: u64) -> Vec<Element> {
        let mut index = index;
        (0..self.tier.depth())
            .map(|level| {
                let sibling = self.node(level, index ^ 1);
                index >>= 1;
                sibling
            })
            .collect()
    }

    /// Serializes the full state as JSON with compact element text.
    pub fn serialize(&self) -> Result<String, MapError> {
        let snapshot = SerializedMap {
            root: element_to_compact(&self.root),
            length: self.length.to_string(),
            nodes: self
                .nodes
                .iter()
                .map(|row| row.iter().map(element_to_compact).collect())
                .collect(),
            sorted_leaves: self
                .sorted_leaves
                .iter()
                .map(|leaf| {
                    [
                        element_to_compact(&leaf.key),
                        element_to_compact(&leaf.next_key),
                        element_to_compact(&leaf.value),
                        element_to_compact(&Element::from(leaf.index)),
                    ]
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Restores a map of `tier` from [`MembershipMap::serialize`] output.
    pub fn deserialize(input: &str, tier: Tier) -> Result<Self, MapError> {
        let snapshot: SerializedMap = serde_json::from_str(input)?;
        let root = element_from_compact(&snapshot.root)?;
        let length: u64 = snapshot
            .length
            .parse()
            .map_err(|_| MapError::Corrupt(format!("invalid length {}", snapshot.length)))?;
        let nodes = snapshot
            .nodes
            .iter()
            .map(|row| {
                row.iter()
                    .map(|text| element_from_compact(text))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut sorted_leaves = Vec::with_capacity(snapshot.sorted_leaves.len());
        for [key, next_key, value, index] in &snapshot.sorted_leaves {
            let index = element_from_compact(index)?;
            sorted_leaves.push(Leaf {
                key: element_from_compact(key)?,
                next_key: element_from_compact(next_key)?,
                value: element_from_compact(value)?,
                index: crate::encoding::element_to_u64(&index)
                    .ok_or_else(|| MapError::Corrupt("leaf index out of range".into()))?,
            });
        }
        let map = Self {
            tier,
            root,
            length,
            sorted_leaves,
            nodes,
        };
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<(), MapError> {
        let depth = self.tier.depth();
        if self.nodes.len() != depth + 1 {
            return Err(MapError::Corrupt(format!(
                "node table has {} levels, tier {} needs {}",
                self.nodes.len(),
                self.tier,
                depth + 1
            )));
        }
        if self.length > self.tier.capacity() || self.length != self.sorted_leaves.len() as u64 {
            return Err(MapError::Corrupt("length does not match leaves".into()));
        }
        if self.sorted_leaves.first().map(|leaf| leaf.key.is_zero()) != Some(true) {
            return Err(MapError::Corrupt("missing sentinel leaf".into()));
        }
        let mut seen = vec![false; self.length as usize];
        for (pos, leaf) in self.sorted_leaves.iter().enumerate() {
            let expected_next = self
                .sorted_leaves
                .get(pos + 1)
                .map(|next| next.key)
                .unwrap_or_else(Element::zero);
            if leaf.next_key != expected_next {
                return Err(MapError::Corrupt(format!("broken key chain at leaf {pos}")));
            }
            if pos > 0 && self.sorted_leaves[pos - 1].key >= leaf.key {
                return Err(MapError::Corrupt(format!("leaves unsorted at {pos}")));
            }
            let slot = seen
                .get_mut(leaf.index as usize)
                .ok_or_else(|| MapError::Corrupt(format!("leaf index {} out of range", leaf.index)))?;
            if *slot {
                return Err(MapError::Corrupt(format!("duplicate leaf index {}", leaf.index)));
            }
            *slot = true;
        }
        self.check_nodes()?;
        if self.node(depth, 0) != self.root {
            return Err(MapError::Corrupt("root does not match node table".into()));
        }
        Ok(())
    }

    /// Rebuilds every level from the leaves and compares it with the table.
    fn check_nodes(&self) -> Result<(), MapError> {
        let mut row = vec![Element::zero(); self.sorted_leaves.len()];
        for leaf in &self.sorted_leaves {
            row[leaf.index as usize] = leaf.hash();
        }
        for level in 0..=self.tier.depth() {
            if self.nodes[level] != row {
                return Err(MapError::Corrupt(format!("node table differs from leaves at level {level}")));
            }
            row = row
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).copied().unwrap_or_else(|| empty_node(level));
                    hash_pair(&pair[0], &right)
                })
                .collect();
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedMap {
    root: String,
    length: String,
    nodes: Vec<Vec<String>>,
    sorted_leaves: Vec<[String; 4]>,
}
