// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Core library for GitSnapFS
//!
//! Exposes the snapshots of a git repository through a small set of
//! building blocks: a narrow adapter over the git object store, an
//! inode ledger that derives stable 64-bit inode numbers from object
//! ids, and an append-only state log that lets the ledger survive a
//! hot upgrade of the serving process.

#![deny(missing_docs)]

mod config;
mod error;
#[cfg(test)]
#[allow(missing_docs)]
pub mod fixtures;
pub mod inode;
pub mod repo;
pub mod state;

pub use config::{get_config, load_config, Cache, Config, State, Ttl};
pub use error::{Error, Result};

/// The version of this crate, as reported by the build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
