//! Runtime configuration for stores, vaults and proving keys.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::identity::IdentityVault;
use crate::membership::{FileStore, MapPool, MembershipStore, Tier, DEFAULT_POOL_CAPACITY};
use crate::tally::{Groth16Backend, TallyError, TallyMachine, DEFAULT_SETUP_SEED};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    /// Config file could not be read.
    Io(#[from] std::io::Error),
    #[error("config JSON error: {0}")]
    /// Config file was malformed.
    Json(#[from] serde_json::Error),
    #[error("invalid {key}: {value}")]
    /// A value failed validation.
    Invalid {
        /// Setting name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Settings shared by aggregators and electors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallyConfig {
    /// Directory of persisted group maps.
    pub store_dir: PathBuf,
    /// Directory of private identity records.
    pub private_dir: PathBuf,
    /// Maps kept resident in the pool.
    pub pool_capacity: usize,
    /// Tier for newly created maps.
    pub default_tier: Tier,
    /// Seed for transition key generation.
    pub setup_seed: u64,
}

impl Default for TallyConfig {
    fn default() -> Self {
        let home = env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            store_dir: PathBuf::from("data").join("groups"),
            private_dir: home.join(".private"),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            default_tier: Tier::Small,
            setup_seed: DEFAULT_SETUP_SEED,
        }
    }
}

fn parse_seed(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl TallyConfig {
    /// Defaults overridden by `CLAIM_TALLY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Ok(dir) = env::var("CLAIM_TALLY_STORE_DIR") {
            cfg.store_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("CLAIM_TALLY_PRIVATE_DIR") {
            cfg.private_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var("CLAIM_TALLY_POOL_CAPACITY") {
            cfg.pool_capacity = value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "CLAIM_TALLY_POOL_CAPACITY",
                value: value.clone(),
            })?;
        }
        if let Ok(value) = env::var("CLAIM_TALLY_DEFAULT_TIER") {
            cfg.default_tier = value.parse().map_err(|_| ConfigError::Invalid {
                key: "CLAIM_TALLY_DEFAULT_TIER",
                value: value.clone(),
            })?;
        }
        if let Ok(value) = env::var("CLAIM_TALLY_SETUP_SEED") {
            cfg.setup_seed = parse_seed(&value).ok_or_else(|| ConfigError::Invalid {
                key: "CLAIM_TALLY_SETUP_SEED",
                value: value.clone(),
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads a JSON config file; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "poolCapacity",
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Empty pool of the configured capacity.
    pub fn pool(&self) -> MapPool {
        MapPool::new(NonZeroUsize::new(self.pool_capacity).unwrap_or(NonZeroUsize::MIN))
    }

    /// File-backed membership store in `store_dir`.
    pub fn membership_store(&self) -> MembershipStore<FileStore> {
        MembershipStore::new(FileStore::new(&self.store_dir), self.pool())
            .with_default_tier(self.default_tier)
    }

    /// Identity vault in `private_dir`.
    pub fn vault(&self) -> IdentityVault {
        IdentityVault::new(&self.private_dir)
    }

    /// Tally machine with keys derived from `setup_seed`.
    pub fn machine(&self) -> Result<TallyMachine<Groth16Backend>, TallyError> {
        Ok(TallyMachine::new(Groth16Backend::setup(self.setup_seed)?))
    }
}
