// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: Lazy<RwLock<Option<Arc<Config>>>> = Lazy::new(|| RwLock::new(None));

/// Cache timeouts handed to the kernel, in seconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Ttl {
    /// Attribute timeout for entries under `/commits/<id>`.
    pub attr: u64,
    /// Entry timeout for entries under `/commits/<id>`.
    pub entry: u64,
    /// Timeout for `/HEAD` and entries under `/branches` and `/tags`,
    /// whose targets move when refs move.
    pub refs: u64,
}

impl Default for Ttl {
    fn default() -> Self {
        Self {
            attr: 300,
            entry: 300,
            refs: 2,
        }
    }
}

/// Bounds for the in-memory object caches.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cache {
    /// Maximum number of decoded trees held in memory.
    pub tree_capacity: u64,
    /// Maximum total size, in bytes, of the small-blob cache.
    pub blob_bytes: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            tree_capacity: 4096,
            blob_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Persistence of the inode collision ledger.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct State {
    /// Where the ledger log is written, if anywhere.
    pub file: Option<PathBuf>,
}

/// Runtime configuration for a gitsnapfs mount.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Kernel cache timeouts.
    pub ttl: Ttl,
    /// Object cache bounds.
    pub cache: Cache,
    /// Ledger persistence.
    pub state: State,
}

impl Config {
    /// Get the current loaded config, loading it if needed.
    pub fn current() -> Result<Arc<Config>> {
        get_config()
    }

    /// Make this config the current one returned by [`get_config`].
    pub fn make_current(self) -> Result<Arc<Config>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!("config lock poisoned: {err}"))
        })?;
        Ok(Arc::clone(lock.insert(Arc::new(self))))
    }
}

/// Get the current gitsnapfs config, fetching it from the environment if needed.
pub fn get_config() -> Result<Arc<Config>> {
    {
        let lock = CONFIG.read().map_err(|err| {
            crate::Error::String(format!("config lock poisoned: {err}"))
        })?;
        if let Some(config) = &*lock {
            return Ok(Arc::clone(config));
        }
    }
    load_config()?.make_current()
}

/// Load the gitsnapfs configuration from the environment, ignoring
/// any previously loaded one.
///
/// Every field can be overridden with a `GITSNAPFS_` variable, eg
/// `GITSNAPFS_TTL_REFS=5` or `GITSNAPFS_STATE_FILE=/var/lib/gitsnapfs/ledger`.
pub fn load_config() -> Result<Config> {
    let config = ::config::Config::builder()
        .add_source(::config::Config::try_from(&Config::default())?)
        .add_source(::config::Environment::with_prefix("GITSNAPFS").separator("_"))
        .build()?;
    Ok(config.try_deserialize()?)
}
