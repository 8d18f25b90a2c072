// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Hot upgrade of the serving process.
//!
//! On the upgrade trigger the coordinator stops admitting new
//! requests, lets the in-flight ones reply, flushes the inode ledger
//! and re-executes the current binary with the FUSE channel descriptor
//! in its environment. The kernel holds the mount the whole time, so
//! clients only observe a short pause.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gitsnapfs::inode::InodeLedger;
use gitsnapfs::Error;
use tokio::sync::Notify;

use crate::channel::Channel;

#[cfg(test)]
#[path = "./upgrade_test.rs"]
mod upgrade_test;

/// Environment variable carrying the FUSE channel descriptor across exec.
pub const ENV_FUSE_FD: &str = "GITSNAPFS_FUSE_FD";
/// Environment variable carrying the ledger state path across exec.
pub const ENV_STATE: &str = "GITSNAPFS_STATE";

/// How long new requests are held at the gate while an upgrade drains.
const QUIESCE_HOLD: Duration = Duration::from_millis(200);
/// How long the coordinator waits for in-flight requests before
/// abandoning the upgrade attempt.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The barrier between request dispatch and the exec handover.
///
/// Every dispatched request holds a guard for its lifetime; the
/// coordinator waits for the count to reach zero before it may exec.
#[derive(Debug, Default)]
pub struct UpgradeGate {
    quiesced: AtomicBool,
    in_flight: AtomicU64,
    drained: Notify,
    resumed: Notify,
}

/// Held by one in-flight request from dispatch until its reply is sent.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    gate: &'a UpgradeGate,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::AcqRel) == 1
            && self.gate.quiesced.load(Ordering::Acquire)
        {
            self.gate.drained.notify_waiters();
        }
    }
}

impl UpgradeGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an upgrade is currently draining requests.
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    /// Register one in-flight request.
    ///
    /// During a quiesce the request is held briefly so the drain can
    /// reach zero; the hold is bounded so a failed exec can never
    /// stall the mount.
    pub async fn enter(&self) -> RequestGuard<'_> {
        if self.quiesced.load(Ordering::Acquire) {
            let resumed = self.resumed.notified();
            if self.quiesced.load(Ordering::Acquire) {
                let _ = tokio::time::timeout(QUIESCE_HOLD, resumed).await;
            }
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        RequestGuard { gate: self }
    }

    /// Stop admitting new requests and wait for in-flight ones to
    /// finish. Returns false if the drain did not complete in time.
    pub async fn quiesce(&self, timeout: Duration) -> bool {
        self.quiesced.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let _ = tokio::time::timeout(remaining, drained).await;
        }
    }

    /// Reopen the gate after a failed upgrade.
    pub fn resume(&self) {
        self.quiesced.store(false, Ordering::Release);
        self.resumed.notify_waiters();
    }

    /// The number of requests currently being served.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Drives the exec handover when an upgrade is requested.
pub struct Coordinator {
    gate: Arc<UpgradeGate>,
    ledger: Arc<InodeLedger>,
    channel: Arc<Channel>,
    argv: Vec<CString>,
}

impl Coordinator {
    /// Capture the state needed for a later handover. The argument
    /// vector is taken now so the re-exec repeats the original
    /// invocation exactly.
    pub fn new(gate: Arc<UpgradeGate>, ledger: Arc<InodeLedger>, channel: Arc<Channel>) -> Self {
        let argv = std::env::args_os()
            .filter_map(|arg| CString::new(arg.as_bytes()).ok())
            .collect();
        Self {
            gate,
            ledger,
            channel,
            argv,
        }
    }

    /// Quiesce, persist and re-execute the current binary.
    ///
    /// On success this never returns: the process image is replaced
    /// and the next incarnation adopts the channel from
    /// [`ENV_FUSE_FD`]. On failure the gate reopens and the error
    /// describes why the old process keeps serving.
    pub async fn upgrade(&self) -> Error {
        tracing::info!("upgrade requested, quiescing requests...");
        if !self.gate.quiesce(DRAIN_TIMEOUT).await {
            self.gate.resume();
            return Error::new(format!(
                "upgrade abandoned: {} requests still in flight after {DRAIN_TIMEOUT:?}",
                self.gate.in_flight()
            ));
        }

        if let Err(err) = self.ledger.flush() {
            self.gate.resume();
            return err;
        }
        if let Some(path) = self.ledger.log_path() {
            std::env::set_var(ENV_STATE, path);
        }
        std::env::set_var(ENV_FUSE_FD, self.channel.raw_fd().to_string());

        let exe = match CString::new("/proc/self/exe") {
            Ok(exe) => exe,
            Err(_) => unreachable!("static path contains no NUL"),
        };
        tracing::info!(fd = self.channel.raw_fd(), "re-executing for upgrade");
        let err = match nix::unistd::execv(&exe, &self.argv) {
            Err(errno) => Error::from(errno),
            // execv only ever returns on failure
            Ok(infallible) => match infallible {},
        };

        // the exec did not happen; withdraw the handover environment
        // and return to serving on this binary
        std::env::remove_var(ENV_FUSE_FD);
        self.gate.resume();
        tracing::error!("upgrade exec failed, resuming service: {err}");
        err
    }

    /// The gate shared with the request dispatch path.
    pub fn gate(&self) -> &Arc<UpgradeGate> {
        &self.gate
    }
}
