// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Virtual filesystem implementation for GitSnapFS
//!
//! Provides the FUSE path resolver over a git object store, the
//! ref-freshness watcher that keeps kernel dentries honest, and the
//! hot-upgrade coordinator that re-executes the daemon without
//! unmounting.

#![deny(missing_docs)]

mod channel;
#[cfg(test)]
#[allow(missing_docs)]
pub mod fixtures;
mod fuse;
mod upgrade;
mod watch;

pub use channel::Channel;
pub use fuse::{Config, Filesystem, Session};
pub use upgrade::{Coordinator, UpgradeGate, ENV_FUSE_FD, ENV_STATE};
pub use watch::RefWatcher;
