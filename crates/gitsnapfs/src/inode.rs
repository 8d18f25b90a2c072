// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Stable inode numbers for git objects.
//!
//! An inode is the low 60 bits of the object id with a 4-bit
//! object-type tag in the high nibble. The tag keeps blobs, trees and
//! symlinks that share low bits apart; genuine collisions within one
//! type are detected lazily and the loser is refused. The ledger of
//! observed bindings is the only long-lived state in the system.

use std::path::Path;

use dashmap::{DashMap, DashSet};
use gix::ObjectId;

use crate::state::{Record, StateLog};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./inode_test.rs"]
mod inode_test;

/// The root directory inode, fixed by the FUSE protocol.
pub const ROOT_INO: u64 = 1;
/// The `/commits` directory.
pub const COMMITS_INO: u64 = 2;
/// The `/branches` directory.
pub const BRANCHES_INO: u64 = 3;
/// The `/tags` directory.
pub const TAGS_INO: u64 = 4;
/// The `/HEAD` symlink.
pub const HEAD_INO: u64 = 5;

const RESERVED_ROOT_MAX: u64 = HEAD_INO;

const TAG_SHIFT: u32 = 60;
const LOW_MASK: u64 = (1 << TAG_SHIFT) - 1;
const GITLINK_BIT: u64 = 1 << 59;

/// The object-type tag occupying the top nibble of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectTag {
    /// File content.
    Blob = 0,
    /// A directory.
    Tree = 1,
    /// A commit (reserved by the encoding; commit directories bind
    /// their root tree instead).
    Commit = 2,
    /// A symbolic link.
    Symlink = 3,
    /// Fixed roots and gitlink placeholders; never ledger-backed.
    Synthetic = 0xF,
}

impl ObjectTag {
    /// The raw nibble value of this tag.
    pub fn raw(&self) -> u8 {
        *self as u8
    }

    /// Decode a raw nibble back into a tag.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Blob),
            1 => Some(Self::Tree),
            2 => Some(Self::Commit),
            3 => Some(Self::Symlink),
            0xF => Some(Self::Synthetic),
            _ => None,
        }
    }
}

/// Compute the inode a git object deterministically maps to.
///
/// The result depends only on the object id bytes and the tag, so it
/// is identical across processes, restarts and hot upgrades.
pub fn derive_ino(oid: &ObjectId, tag: ObjectTag) -> u64 {
    let bytes = oid.as_bytes();
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&bytes[bytes.len() - 8..]);
    (u64::from_be_bytes(tail) & LOW_MASK) | ((tag.raw() as u64) << TAG_SHIFT)
}

/// The placeholder inode for a submodule gitlink entry.
///
/// Gitlinks surface as empty directories with no backing object, so
/// they live in the synthetic range: high nibble `0xF` with bit 59
/// set, leaving them disjoint from every git-derived inode and from
/// the fixed roots. Derivation stays deterministic so the placeholder
/// keeps its identity across a hot upgrade.
pub fn gitlink_ino(oid: &ObjectId) -> u64 {
    let bytes = oid.as_bytes();
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&bytes[bytes.len() - 8..]);
    (u64::from_be_bytes(tail) & (GITLINK_BIT - 1))
        | GITLINK_BIT
        | ((ObjectTag::Synthetic.raw() as u64) << TAG_SHIFT)
}

/// Whether an inode lies in the gitlink placeholder range.
pub fn is_gitlink(ino: u64) -> bool {
    ino >> TAG_SHIFT == ObjectTag::Synthetic.raw() as u64 && ino & GITLINK_BIT != 0
}

/// Whether an inode is one of the fixed root inodes.
pub fn is_root_ino(ino: u64) -> bool {
    (ROOT_INO..=RESERVED_ROOT_MAX).contains(&ino)
}

/// A recorded `ino -> (oid, tag)` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// The full object id that won this inode.
    pub oid: ObjectId,
    /// The object-type tag it was bound with.
    pub tag: ObjectTag,
}

/// The collision ledger: every inode ever handed out, plus the set of
/// inodes at which a second, different object was observed.
///
/// The first binding at an inode is immutable for the life of the
/// mount. Later attempts to bind a different object mark the inode as
/// clashed and are refused; the winner keeps resolving.
#[derive(Debug, Default)]
pub struct InodeLedger {
    bindings: DashMap<u64, Binding>,
    clashes: DashSet<u64>,
    log: Option<StateLog>,
}

impl InodeLedger {
    /// An in-memory ledger with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a ledger backed by the append-only log at `path`,
    /// replaying any bindings a previous process recorded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (log, records) = StateLog::open(path)?;
        let ledger = Self {
            bindings: DashMap::with_capacity(records.len()),
            clashes: DashSet::new(),
            log: Some(log),
        };
        for record in records {
            let tag = ObjectTag::from_raw(record.tag)
                .ok_or(Error::CorruptStateRecord(record.ino))?;
            // first record at an inode wins, matching live allocation
            ledger.bindings.entry(record.ino).or_insert(Binding {
                oid: record.oid,
                tag,
            });
            if record.clash {
                ledger.clashes.insert(record.ino);
            }
        }
        Ok(ledger)
    }

    /// The path of the backing log, if this ledger is persistent.
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|log| log.path())
    }

    /// Bind `(oid, tag)` to its derived inode, or refuse the binding.
    ///
    /// Exactly one object ever wins an inode: concurrent callers with
    /// the same candidate serialize on the ledger entry, and all
    /// losers observe [`Error::InodeClash`].
    pub fn allocate(&self, oid: &ObjectId, tag: ObjectTag) -> Result<u64> {
        let ino = derive_ino(oid, tag);
        if is_root_ino(ino) {
            // a blob whose low bits land on a fixed root inode can
            // never be bound; the roots are not ledger entries
            tracing::warn!(ino, %oid, "object collides with a reserved root inode");
            return Err(Error::InodeClash(ino));
        }
        match self.bindings.entry(ino) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Binding { oid: *oid, tag });
                self.append(Record {
                    ino,
                    tag: tag.raw(),
                    oid: *oid,
                    clash: false,
                });
                Ok(ino)
            }
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                let winner = *slot.get();
                drop(slot);
                if winner.oid == *oid && winner.tag == tag {
                    return Ok(ino);
                }
                if self.clashes.insert(ino) {
                    tracing::warn!(
                        ino,
                        winner = %winner.oid,
                        loser = %oid,
                        "inode collision detected"
                    );
                    self.append(Record {
                        ino,
                        tag: winner.tag.raw(),
                        oid: winner.oid,
                        clash: true,
                    });
                }
                Err(Error::InodeClash(ino))
            }
        }
    }

    /// The winning binding at `ino`, if any object was ever bound there.
    pub fn bound(&self, ino: u64) -> Option<Binding> {
        self.bindings.get(&ino).map(|entry| *entry.value())
    }

    /// Whether a second, different object was ever observed at `ino`.
    pub fn is_clash(&self, ino: u64) -> bool {
        self.clashes.contains(&ino)
    }

    /// The number of bindings currently held.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the ledger holds no bindings yet.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Flush the backing log to stable storage, if there is one.
    ///
    /// Called at quiesce boundaries and before an exec handover.
    pub fn flush(&self) -> Result<()> {
        match &self.log {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }

    fn append(&self, record: Record) {
        if let Some(log) = &self.log {
            if let Err(err) = log.append(&record) {
                // the in-memory binding remains authoritative; losing
                // a log record only weakens collision detection after
                // the next restart
                tracing::error!(ino = record.ino, "failed to append ledger record: {err}");
            }
        }
    }
}
