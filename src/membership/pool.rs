//! Bounded in-memory cache of live maps.
//!
//! The pool is owned by whoever runs an aggregation session and handed to the
//! [`MembershipStore`](super::MembershipStore); there is no process-global
//! instance.  Eviction is least-recently-used and never touches persisted
//! state.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use tracing::debug;

use super::map::MembershipMap;

/// Default number of maps kept resident.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// LRU cache of maps keyed by group id.
#[derive(Debug)]
pub struct MapPool {
    capacity: NonZeroUsize,
    maps: HashMap<String, MembershipMap>,
    order: VecDeque<String>,
}

impl Default for MapPool {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_POOL_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl MapPool {
    /// Creates an empty pool holding at most `capacity` maps.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            maps: HashMap::with_capacity(capacity.get()),
            order: VecDeque::with_capacity(capacity.get()),
        }
    }

    /// Maximum number of resident maps.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of resident maps.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// True when `group_id` is resident.
    pub fn contains(&self, group_id: &str) -> bool {
        self.maps.contains_key(group_id)
    }

    fn touch(&mut self, group_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == group_id) {
            if let Some(id) = self.order.remove(pos) {
                self.order.push_back(id);
            }
        }
    }

    /// Returns the cached map and marks it most recently used.
    pub fn get(&mut self, group_id: &str) -> Option<&MembershipMap> {
        if !self.maps.contains_key(group_id) {
            return None;
        }
        self.touch(group_id);
        self.maps.get(group_id)
    }

    /// Caches `map`, evicting the least recently used entry when full.
    pub fn put(&mut self, group_id: &str, map: MembershipMap) {
        if self.maps.insert(group_id.to_string(), map).is_some() {
            self.touch(group_id);
            return;
        }
        self.order.push_back(group_id.to_string());
        while self.maps.len() > self.capacity.get() {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.maps.remove(&evicted);
            debug!(group = %evicted, "evicted map from pool");
        }
    }

    /// Replaces a resident entry; absent entries are left absent.
    pub fn refresh(&mut self, group_id: &str, map: &MembershipMap) -> bool {
        match self.maps.get_mut(group_id) {
            Some(slot) => {
                *slot = map.clone();
                self.touch(group_id);
                true
            }
            None => false,
        }
    }

    /// Drops a resident entry, returning it if present.
    pub fn remove(&mut self, group_id: &str) -> Option<MembershipMap> {
        let map = self.maps.remove(group_id)?;
        self.order.retain(|id| id != group_id);
        Some(map)
    }

    /// Resident group ids from least to most recently used.
    pub fn resident(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
