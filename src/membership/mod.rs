//! Authenticated group membership.
//!
//! [`MembershipMap`] is the indexed Merkle map every tally membership check
//! runs against.  [`MembershipStore`] fronts a persistent [`GroupStore`] with
//! an explicitly owned [`MapPool`].

pub mod map;
pub mod pool;
pub mod store;

pub use map::{ExclusionProof, InclusionProof, Leaf, MapError, MembershipMap, Tier};
pub use pool::{MapPool, DEFAULT_POOL_CAPACITY};
pub use store::{
    FileStore, GroupStore, MapOptions, MembershipStore, MemoryStore, StoreError, StoredGroup,
};
