// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::SessionACL;
use gitsnapfs::inode::InodeLedger;
use gitsnapfs::repo::Repository;
use gitsnapfs_vfs::{Channel, Coordinator, RefWatcher, Session, UpgradeGate, ENV_FUSE_FD};
use tokio::signal::unix::{signal, SignalKind};

mod args;

// Daemonization must happen between the mount and the creation of the
// multi-thread runtime, so the async machinery cannot be set up before
// the command has fully parsed and mounted.
fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}
fn main2() -> i32 {
    let mut opt = CmdMount::parse();
    opt.logging.configure();

    let result = opt.run();
    match result {
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
        Ok(code) => code,
    }
}

/// Mount the snapshots of a git repository as a read-only filesystem
#[derive(Debug, Parser)]
#[clap(name = "gitsnapfs")]
pub struct CmdMount {
    #[clap(flatten)]
    logging: args::Logging,

    /// Path to the repository to serve (a .git directory or a bare repo)
    #[clap(long)]
    repo: PathBuf,

    /// Existing empty directory to mount over
    #[clap(long)]
    mountpoint: PathBuf,

    /// Allow other users to access the mount
    #[clap(long)]
    allow_other: bool,

    /// Attribute timeout for immutable entries, in seconds
    #[clap(long)]
    attr_ttl: Option<u64>,

    /// Entry timeout for immutable entries, in seconds
    #[clap(long)]
    entry_ttl: Option<u64>,

    /// Timeout for HEAD and the branch/tag symlinks, in seconds
    #[clap(long)]
    ref_ttl: Option<u64>,

    /// Maximum number of decoded trees held in memory
    #[clap(long)]
    tree_cache: Option<u64>,

    /// Maximum total bytes of blob content held in memory
    #[clap(long)]
    blob_small_cache: Option<u64>,

    /// Persist the inode collision ledger to this file
    #[clap(long, env = "GITSNAPFS_STATE")]
    state_file: Option<PathBuf>,

    /// Internal: adopt this FUSE descriptor instead of mounting
    #[clap(long, hide = true)]
    takeover_fuse_fd: Option<i32>,

    /// Do not daemonize the filesystem, run it in the foreground instead
    #[clap(long, short)]
    foreground: bool,
}

impl CmdMount {
    pub fn run(&mut self) -> Result<i32> {
        let mut settings = (*gitsnapfs::get_config()?).clone();
        if let Some(attr) = self.attr_ttl {
            settings.ttl.attr = attr;
        }
        if let Some(entry) = self.entry_ttl {
            settings.ttl.entry = entry;
        }
        if let Some(refs) = self.ref_ttl {
            settings.ttl.refs = refs;
        }
        if let Some(trees) = self.tree_cache {
            settings.cache.tree_capacity = trees;
        }
        if let Some(bytes) = self.blob_small_cache {
            settings.cache.blob_bytes = bytes;
        }
        if let Some(path) = &self.state_file {
            settings.state.file = Some(path.clone());
        }

        let repo = Arc::new(
            Repository::open(&self.repo)
                .with_context(|| format!("failed to open repository {:?}", self.repo))?,
        );

        let mountpoint = self
            .mountpoint
            .canonicalize()
            .context("invalid mount point")?;
        if !mountpoint.is_dir() {
            bail!("mountpoint {mountpoint:?} is not a directory");
        }

        // a descriptor handed over by a previous incarnation takes
        // precedence: the env value is set fresh by each exec, while
        // any --takeover-fuse-fd in the repeated argument vector may
        // be stale
        let takeover = match std::env::var(ENV_FUSE_FD) {
            Ok(value) => Some(
                value
                    .parse::<i32>()
                    .with_context(|| format!("invalid {ENV_FUSE_FD}: {value:?}"))?,
            ),
            Err(_) => self.takeover_fuse_fd,
        };
        std::env::remove_var(ENV_FUSE_FD);

        let channel = match takeover {
            Some(fd) => {
                tracing::info!(fd, "adopting inherited FUSE channel");
                Arc::new(Channel::adopt(fd, mountpoint.clone())?)
            }
            None => {
                tracing::info!(mountpoint = ?mountpoint, "mounting");
                Arc::new(Channel::mount(&mountpoint, self.allow_other)?)
            }
        };

        if !self.foreground && takeover.is_none() {
            tracing::debug!("moving into background...");
            // the mount must exist before we daemonize, otherwise the
            // caller could observe an empty directory
            nix::unistd::daemon(false, true).context("failed to daemonize")?;
        }

        let ledger = Arc::new(match &settings.state.file {
            Some(path) => InodeLedger::load(path)
                .with_context(|| format!("failed to load ledger state from {path:?}"))?,
            None => InodeLedger::new(),
        });

        // the daemonization above must complete before any threads
        // exist, so the runtime is built last
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to establish runtime")?;

        let result = rt.block_on(async {
            let mut interrupt =
                signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("terminate signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut upgrade =
                signal(SignalKind::user_defined1()).context("upgrade signal handler")?;

            let gate = Arc::new(UpgradeGate::new());
            let opts = gitsnapfs_vfs::Config::from_settings(&settings);
            let fs = gitsnapfs_vfs::Filesystem::new(
                Arc::clone(&repo),
                Arc::clone(&ledger),
                opts,
            );
            let session_fs = Session::new(fs, Arc::clone(&gate), tokio::runtime::Handle::current());

            let acl = if self.allow_other {
                SessionACL::All
            } else {
                SessionACL::Owner
            };
            let mut session = fuser::Session::from_fd(session_fs, channel.session_fd()?, acl);

            let _watcher = match RefWatcher::spawn(Arc::clone(&repo), session.notifier()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    // the short ref ttl keeps symlinks fresh without it
                    tracing::warn!("ref watcher unavailable: {err}");
                    None
                }
            };

            let coordinator =
                Coordinator::new(Arc::clone(&gate), Arc::clone(&ledger), Arc::clone(&channel));

            tracing::info!("serving filesystem");
            let mut serving = tokio::task::spawn_blocking(move || session.run());
            loop {
                tokio::select! {
                    res = &mut serving => {
                        tracing::info!("filesystem shutting down");
                        res.context("FUSE session task failed")?
                            .context("FUSE session failed")?;
                        return Ok(0);
                    }
                    _ = upgrade.recv() => {
                        // returns only if the exec failed; the old
                        // binary carries on serving
                        let err = coordinator.upgrade().await;
                        tracing::error!("hot upgrade failed: {err}");
                    }
                    _ = interrupt.recv() => break,
                    _ = terminate.recv() => break,
                    _ = quit.recv() => break,
                }
            }

            tracing::info!("signal received, unmounting");
            ledger.flush()?;
            channel.unmount()?;
            Ok(0)
        });

        // long running tasks may still be waiting for signals or
        // events which will never come; don't block forever when the
        // runtime is dropped
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result
    }
}
