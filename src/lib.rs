#![deny(missing_docs)]

//! # claim_tally
//!
//! **claim_tally** implements anonymous, Sybil-resistant voting on claims.
//! Electors vote under pseudonymous identities, an untrusted aggregator folds
//! their signed votes into a chained tally proof, and an anchoring account
//! seals the result once the tally is final.
//!
//! ## Features
//!
//! * **Identities and signals**: the [`identity`] module derives identity
//!   commitments from fresh Baby Jubjub keys ([`keys`]) and a pin; the
//!   [`signal`] module builds nullifier-bound, signed vote signals and
//!   [`Ballot`]s; [`ownership`] proves control of a commitment in zero
//!   knowledge.
//! * **Authenticated membership**: [`membership::MembershipMap`] is an indexed
//!   Merkle map with inclusion and exclusion proofs and lossless
//!   serialization, fronted by a pooled [`membership::MembershipStore`].
//! * **Tally state machine**: the [`tally`] module proves `init`, `rollup` and
//!   `final` transitions with Groth16 over BN254 and chains them into a
//!   [`TallyProof`] that anyone can verify back to genesis.  Rollup circuits
//!   check membership, replay and the elector's signature in-circuit with the
//!   [`gadgets`] twins of the native Poseidon [`hash`]es.
//! * **Anchoring**: [`anchor::ClaimAccount`] accepts a final tally over its
//!   pinned group roots once and stores the packed vote numeral.
//!
//! ## Usage
//!
//! ```rust
//! use claim_tally::membership::{MembershipMap, Tier};
//! use claim_tally::Element;
//!
//! let mut electors = MembershipMap::new(Tier::Small);
//! electors.insert(Element::from(1001u64), Element::from(1u64)).unwrap();
//! assert!(electors.assert_included(&Element::from(1001u64)).is_ok());
//! assert!(electors.assert_not_included(&Element::from(7001u64)).is_ok());
//! ```
//!
//! The library emits `tracing` events and installs no subscriber.

pub mod anchor;
pub mod config;
pub mod encoding;
pub mod gadgets;
pub mod hash;
pub mod identity;
pub mod keys;
pub mod membership;
pub mod ownership;
pub mod signal;
pub mod tally;

pub use anchor::{pack_votes, unpack_votes, AnchorError, ClaimAccount, ClaimAction, VoteMark};
pub use config::{ConfigError, TallyConfig};
pub use encoding::{Element, EncodingError};
pub use hash::hash_elements;
pub use identity::{Identity, IdentityError, IdentityVault};
pub use keys::{KeyError, PublicKey, SecretKey, Signature};
pub use membership::{MapError, MembershipMap, MembershipStore, StoreError, Tier};
pub use ownership::{prove_ownership, OwnershipProof};
pub use signal::{vote_signal, Ballot, Signal, SignalError, Vote};
pub use tally::{
    ClaimResult, ClaimState, GroupRoots, Groth16Backend, ProofBackend, TallyError, TallyMachine,
    TallyProof, TallySession,
};
