// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Ref freshness notifications.
//!
//! Refs are the only mutable part of the exposed tree: `/HEAD` and the
//! symlinks under `/branches` and `/tags` move when the repository
//! moves. A filesystem watcher on the git directory triggers a rescan,
//! and every name whose target changed gets a dentry invalidation so
//! the kernel re-issues `lookup` instead of serving the old target.
//! Commit content is immutable and is never invalidated.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use gitsnapfs::inode::{BRANCHES_INO, ROOT_INO, TAGS_INO};
use gitsnapfs::repo::{ObjectId, RefNamespace, Repository};
use gitsnapfs::{Error, Result};
use notify::{RecursiveMode, Watcher};

#[cfg(test)]
#[path = "./watch_test.rs"]
mod watch_test;

/// Watches the repository's refs and pushes invalidations through the
/// FUSE channel. Dropping the watcher stops the background thread.
pub struct RefWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// One dentry the kernel should forget.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Invalidation {
    pub parent: u64,
    pub name: String,
}

/// The resolved target of every ref at one point in time.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RefSnapshot {
    head: Option<ObjectId>,
    branches: BTreeMap<String, ObjectId>,
    tags: BTreeMap<String, ObjectId>,
}

impl RefSnapshot {
    pub(crate) fn collect(repo: &Repository) -> Self {
        let mut snapshot = Self {
            head: repo.resolve_ref("HEAD").ok(),
            ..Default::default()
        };
        for (namespace, targets) in [
            (RefNamespace::Branches, &mut snapshot.branches),
            (RefNamespace::Tags, &mut snapshot.tags),
        ] {
            let names = repo.enumerate_refs(namespace).unwrap_or_default();
            for name in names {
                let full = format!("{}{}", namespace.prefix(), name);
                if let Ok(oid) = repo.resolve_ref(&full) {
                    targets.insert(name, oid);
                }
            }
        }
        snapshot
    }

    /// The dentries whose targets differ between `self` and `newer`:
    /// changed, added and removed names all need the kernel to look
    /// up again.
    pub(crate) fn diff(&self, newer: &RefSnapshot) -> Vec<Invalidation> {
        let mut out = Vec::new();
        if self.head != newer.head {
            out.push(Invalidation {
                parent: ROOT_INO,
                name: "HEAD".to_owned(),
            });
        }
        diff_namespace(&self.branches, &newer.branches, BRANCHES_INO, &mut out);
        diff_namespace(&self.tags, &newer.tags, TAGS_INO, &mut out);
        out
    }
}

fn diff_namespace(
    old: &BTreeMap<String, ObjectId>,
    new: &BTreeMap<String, ObjectId>,
    parent: u64,
    out: &mut Vec<Invalidation>,
) {
    for (name, target) in old {
        if new.get(name) != Some(target) {
            out.push(Invalidation {
                parent,
                name: name.clone(),
            });
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            out.push(Invalidation {
                parent,
                name: name.clone(),
            });
        }
    }
}

impl RefWatcher {
    /// Start watching `repo`'s refs, pushing invalidations through
    /// `notifier`.
    pub fn spawn(repo: Arc<Repository>, notifier: fuser::Notifier) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .map_err(|err| Error::new(format!("failed to create ref watcher: {err}")))?;

        let git_dir = repo.git_dir().to_owned();
        // HEAD and packed-refs live directly in the git dir; loose
        // refs are replaced by renames below refs/
        watcher
            .watch(&git_dir, RecursiveMode::NonRecursive)
            .map_err(|err| Error::new(format!("failed to watch {git_dir:?}: {err}")))?;
        let refs_dir = git_dir.join("refs");
        if refs_dir.is_dir() {
            watcher
                .watch(&refs_dir, RecursiveMode::Recursive)
                .map_err(|err| Error::new(format!("failed to watch {refs_dir:?}: {err}")))?;
        }

        std::thread::Builder::new()
            .name("gitsnapfs-ref-watch".to_owned())
            .spawn(move || run(repo, notifier, rx))?;

        Ok(Self { _watcher: watcher })
    }
}

fn run(
    repo: Arc<Repository>,
    notifier: fuser::Notifier,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
) {
    let mut previous = RefSnapshot::collect(&repo);
    // ends when the watcher is dropped and the sender disconnects
    while rx.recv().is_ok() {
        // a ref update touches several paths in quick succession;
        // coalesce the burst into one rescan
        std::thread::sleep(Duration::from_millis(20));
        while rx.try_recv().is_ok() {}

        let current = RefSnapshot::collect(&repo);
        for inval in previous.diff(&current) {
            tracing::debug!(parent = inval.parent, name = %inval.name, "invalidating dentry");
            match notifier.inval_entry(inval.parent, OsStr::new(&inval.name)) {
                Ok(()) => (),
                // the kernel simply has no such dentry cached
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => (),
                Err(err) => {
                    tracing::warn!("dentry invalidation failed: {err}");
                }
            }
        }
        previous = current;
    }
}
