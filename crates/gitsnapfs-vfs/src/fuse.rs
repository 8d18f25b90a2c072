// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The FUSE path resolver.
//!
//! Requests arrive from the kernel through a [`Session`] and are
//! answered from three sources only: the fixed synthetic roots, the
//! inode ledger, and the git object store. The resolver itself keeps
//! no state a reply depends on, which is what allows the serving
//! process to be replaced underneath the mount.
//!
//! ```text
//! /commits/<full-hex-oid>/...   snapshot of that commit
//! /branches/<refname>           symlink -> ../commits/<oid>
//! /tags/<refname>               symlink -> ../commits/<oid>
//! /HEAD                         symlink -> ../commits/<oid>
//! ```

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::consts::{
    FUSE_ASYNC_READ,
    FUSE_CACHE_SYMLINKS,
    FUSE_DO_READDIRPLUS,
    FUSE_EXPORT_SUPPORT,
    FUSE_PARALLEL_DIROPS,
    FUSE_READDIRPLUS_AUTO,
};
use fuser::{
    FileAttr,
    FileType,
    KernelConfig,
    ReplyAttr,
    ReplyData,
    ReplyDirectory,
    ReplyDirectoryPlus,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    Request,
};
use gitsnapfs::inode::{
    gitlink_ino,
    is_gitlink,
    is_root_ino,
    InodeLedger,
    ObjectTag,
    BRANCHES_INO,
    COMMITS_INO,
    HEAD_INO,
    ROOT_INO,
    TAGS_INO,
};
use gitsnapfs::repo::{EntryMode, ObjectId, ObjectKind, RefNamespace, Repository, TreeEntry};
use gitsnapfs::{Error, Result};

use crate::upgrade::UpgradeGate;

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

const SYMLINK_TARGET_PREFIX: &str = "../commits/";

/// Options to configure the filesystem and its behavior at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// The user id that owns all files and directories.
    pub uid: nix::unistd::Uid,
    /// The group id that owns all files and directories.
    pub gid: nix::unistd::Gid,
    /// Attribute timeout for immutable entries under `/commits`.
    pub attr_ttl: Duration,
    /// Entry timeout for immutable entries under `/commits`.
    pub entry_ttl: Duration,
    /// Timeout for `/HEAD` and the ref symlinks, whose targets move.
    pub ref_ttl: Duration,
    /// Maximum number of decoded trees held in memory.
    pub tree_cache_capacity: u64,
    /// Maximum total bytes of blob content held in memory.
    pub blob_cache_bytes: u64,
}

impl Config {
    /// Build filesystem options from loaded settings, owned by the
    /// calling user.
    pub fn from_settings(settings: &gitsnapfs::Config) -> Self {
        Self {
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
            attr_ttl: Duration::from_secs(settings.ttl.attr),
            entry_ttl: Duration::from_secs(settings.ttl.entry),
            ref_ttl: Duration::from_secs(settings.ttl.refs),
            tree_cache_capacity: settings.cache.tree_capacity,
            blob_cache_bytes: settings.cache.blob_bytes,
        }
    }
}

/// A resolved entry reply: the attributes plus the timeout the
/// kernel may cache them for.
#[derive(Debug, Clone)]
pub(crate) struct EntryOut {
    pub attr: FileAttr,
    pub ttl: Duration,
}

/// One directory stream entry. `offset` is the ordinal the kernel
/// passes back to resume the stream; ordinals follow source order and
/// never change, so a stream survives process replacement.
#[derive(Debug, Clone)]
pub(crate) struct DirRecord {
    pub offset: i64,
    pub ino: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

/// Attributes remembered from the lookup that materialized a node.
///
/// Everything here is reconstructible from the store; the copy only
/// preserves lookup-time context (commit times, executable bits) that
/// the ledger alone does not carry.
#[derive(Debug, Clone, Copy)]
struct NodeMeta {
    perm: u16,
    size: u64,
    mtime: SystemTime,
}

/// Handles the translation of filesystem requests into git object
/// lookups, and the synthesis of all replied attributes.
pub struct Filesystem {
    repo: Arc<Repository>,
    ledger: Arc<InodeLedger>,
    opts: Config,
    mount_time: SystemTime,
    trees: moka::sync::Cache<ObjectId, Arc<Vec<TreeEntry>>>,
    blobs: moka::sync::Cache<ObjectId, Arc<Vec<u8>>>,
    meta: DashMap<u64, NodeMeta>,
}

impl Filesystem {
    // reported for every node; the filesystem spans no real disk so
    // any consistent value will do for tools like du
    const BLOCK_SIZE: u32 = 512;

    /// Create a filesystem over the given repository and ledger.
    pub fn new(repo: Arc<Repository>, ledger: Arc<InodeLedger>, opts: Config) -> Self {
        let trees = moka::sync::Cache::builder()
            .max_capacity(opts.tree_cache_capacity)
            .build();
        let blobs = moka::sync::Cache::builder()
            .max_capacity(opts.blob_cache_bytes)
            .weigher(|_oid, data: &Arc<Vec<u8>>| data.len().min(u32::MAX as usize) as u32)
            .build();
        Self {
            repo,
            ledger,
            opts,
            mount_time: SystemTime::now(),
            trees,
            blobs,
            meta: DashMap::new(),
        }
    }

    /// The ledger this filesystem allocates inodes from.
    pub fn ledger(&self) -> &Arc<InodeLedger> {
        &self.ledger
    }

    fn tree(&self, oid: ObjectId) -> Result<Arc<Vec<TreeEntry>>> {
        if let Some(entries) = self.trees.get(&oid) {
            return Ok(entries);
        }
        let entries = Arc::new(self.repo.find_tree(oid)?);
        self.trees.insert(oid, Arc::clone(&entries));
        Ok(entries)
    }

    fn blob(&self, oid: ObjectId) -> Result<Arc<Vec<u8>>> {
        if let Some(data) = self.blobs.get(&oid) {
            return Ok(data);
        }
        let data = Arc::new(self.repo.find_blob(oid)?);
        // objects that would dominate the cache bypass it
        if (data.len() as u64) <= self.opts.blob_cache_bytes / 16 {
            self.blobs.insert(oid, Arc::clone(&data));
        }
        Ok(data)
    }

    fn attr(&self, ino: u64, kind: FileType, perm: u16, size: u64, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: (size / Self::BLOCK_SIZE as u64) + 1,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: self.opts.uid.as_raw(),
            gid: self.opts.gid.as_raw(),
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn dir_attr(&self, ino: u64, mtime: SystemTime) -> FileAttr {
        self.attr(ino, FileType::Directory, 0o555, 0, mtime)
    }

    fn symlink_attr(&self, ino: u64, size: u64, mtime: SystemTime) -> FileAttr {
        self.attr(ino, FileType::Symlink, 0o777, size, mtime)
    }

    fn root_entry(&self, ino: u64) -> EntryOut {
        EntryOut {
            attr: self.dir_attr(ino, self.mount_time),
            ttl: self.opts.entry_ttl,
        }
    }

    fn head_target(&self) -> Result<Vec<u8>> {
        let oid = self.repo.resolve_ref("HEAD")?;
        Ok(format!("{SYMLINK_TARGET_PREFIX}{oid}").into_bytes())
    }

    fn ref_target_len(&self) -> u64 {
        (SYMLINK_TARGET_PREFIX.len() + self.repo.hash_len() * 2) as u64
    }

    fn parent_mtime(&self, parent: u64) -> SystemTime {
        self.meta
            .get(&parent)
            .map(|meta| meta.mtime)
            .unwrap_or(self.mount_time)
    }

    /// Resolve one name inside a directory.
    pub(crate) fn lookup_node(&self, parent: u64, name: &[u8]) -> Result<EntryOut> {
        match parent {
            ROOT_INO => match name {
                b"commits" => Ok(self.root_entry(COMMITS_INO)),
                b"branches" => Ok(self.root_entry(BRANCHES_INO)),
                b"tags" => Ok(self.root_entry(TAGS_INO)),
                b"HEAD" => {
                    let size = self.head_target()?.len() as u64;
                    Ok(EntryOut {
                        attr: self.symlink_attr(HEAD_INO, size, self.mount_time),
                        ttl: self.opts.ref_ttl,
                    })
                }
                _ => Err(not_found(name)),
            },
            COMMITS_INO => self.lookup_commit(name),
            BRANCHES_INO => self.lookup_ref(RefNamespace::Branches, name),
            TAGS_INO => self.lookup_ref(RefNamespace::Tags, name),
            HEAD_INO => Err(Error::new_errno(libc::ENOTDIR, "HEAD is not a directory")),
            _ if is_gitlink(parent) => Err(not_found(name)),
            _ => self.lookup_tree_child(parent, name),
        }
    }

    /// `/commits` knows no names until asked: the name itself is the
    /// full lowercase hex commit id, and anything else does not exist.
    fn lookup_commit(&self, name: &[u8]) -> Result<EntryOut> {
        let name = std::str::from_utf8(name).map_err(|_| not_found(name))?;
        let oid = self.repo.parse_object_id(name)?;
        let info = self.repo.find_commit(oid)?;
        let ino = self.ledger.allocate(&info.tree, ObjectTag::Tree)?;
        let mtime = unix_time(info.committer_time);
        self.meta.insert(
            ino,
            NodeMeta {
                perm: 0o555,
                size: 0,
                mtime,
            },
        );
        Ok(EntryOut {
            attr: self.dir_attr(ino, mtime),
            ttl: self.opts.entry_ttl,
        })
    }

    fn lookup_ref(&self, namespace: RefNamespace, name: &[u8]) -> Result<EntryOut> {
        let name = std::str::from_utf8(name).map_err(|_| not_found(name))?;
        let refname = format!("{}{}", namespace.prefix(), name);
        let oid = self.repo.resolve_ref(&refname)?;
        let ino = self.ledger.allocate(&oid, ObjectTag::Symlink)?;
        let size = self.ref_target_len();
        self.meta.insert(
            ino,
            NodeMeta {
                perm: 0o777,
                size,
                mtime: self.mount_time,
            },
        );
        Ok(EntryOut {
            attr: self.symlink_attr(ino, size, self.mount_time),
            ttl: self.opts.ref_ttl,
        })
    }

    fn lookup_tree_child(&self, parent: u64, name: &[u8]) -> Result<EntryOut> {
        let binding = self.ledger.bound(parent).ok_or(Error::StaleInode(parent))?;
        if binding.tag != ObjectTag::Tree {
            return Err(Error::new_errno(libc::ENOTDIR, "not a directory"));
        }
        let entries = self.tree(binding.oid)?;
        let entry = entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| not_found(name))?;
        self.materialize_child(parent, entry)
    }

    /// Turn one tree entry into a kernel-visible node, binding its
    /// inode and recording lookup-time attributes.
    fn materialize_child(&self, parent: u64, entry: &TreeEntry) -> Result<EntryOut> {
        let mtime = self.parent_mtime(parent);
        let (ino, attr) = match entry.mode {
            EntryMode::Tree => {
                let ino = self.ledger.allocate(&entry.oid, ObjectTag::Tree)?;
                (ino, self.dir_attr(ino, mtime))
            }
            EntryMode::Blob | EntryMode::BlobExecutable => {
                let ino = self.ledger.allocate(&entry.oid, ObjectTag::Blob)?;
                let size = self.repo.blob_size(entry.oid)?;
                let perm = if entry.mode == EntryMode::BlobExecutable {
                    0o555
                } else {
                    0o444
                };
                (ino, self.attr(ino, FileType::RegularFile, perm, size, mtime))
            }
            EntryMode::Link => {
                let ino = self.ledger.allocate(&entry.oid, ObjectTag::Symlink)?;
                let size = self.repo.blob_size(entry.oid)?;
                (ino, self.symlink_attr(ino, size, mtime))
            }
            EntryMode::Commit => {
                // submodules surface as empty placeholder directories
                let ino = gitlink_ino(&entry.oid);
                (ino, self.dir_attr(ino, mtime))
            }
        };
        self.meta.insert(
            ino,
            NodeMeta {
                perm: attr.perm,
                size: attr.size,
                mtime,
            },
        );
        Ok(EntryOut {
            attr,
            ttl: self.opts.entry_ttl,
        })
    }

    /// Attributes for any known inode; unknown inodes are stale.
    pub(crate) fn getattr_node(&self, ino: u64) -> Result<(FileAttr, Duration)> {
        match ino {
            ROOT_INO | COMMITS_INO | BRANCHES_INO | TAGS_INO => Ok((
                self.dir_attr(ino, self.mount_time),
                self.opts.attr_ttl,
            )),
            HEAD_INO => {
                let size = self.head_target().map(|t| t.len() as u64).unwrap_or(0);
                Ok((
                    self.symlink_attr(ino, size, self.mount_time),
                    self.opts.ref_ttl,
                ))
            }
            _ if is_gitlink(ino) => Ok((
                self.dir_attr(ino, self.parent_mtime(ino)),
                self.opts.attr_ttl,
            )),
            _ => {
                let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
                if let Some(meta) = self.meta.get(&ino).map(|m| *m.value()) {
                    let kind = match binding.tag {
                        ObjectTag::Tree => FileType::Directory,
                        ObjectTag::Symlink => FileType::Symlink,
                        _ => FileType::RegularFile,
                    };
                    let ttl = match binding.tag {
                        ObjectTag::Symlink => self.opts.ref_ttl,
                        _ => self.opts.attr_ttl,
                    };
                    return Ok((
                        self.attr(ino, kind, meta.perm, meta.size, meta.mtime),
                        ttl,
                    ));
                }
                // no lookup has touched this inode in this process;
                // rebuild what the store alone can tell us
                match binding.tag {
                    ObjectTag::Tree => {
                        Ok((self.dir_attr(ino, self.mount_time), self.opts.attr_ttl))
                    }
                    ObjectTag::Blob => {
                        let size = self.repo.blob_size(binding.oid)?;
                        Ok((
                            self.attr(ino, FileType::RegularFile, 0o444, size, self.mount_time),
                            self.opts.attr_ttl,
                        ))
                    }
                    ObjectTag::Symlink => {
                        let size = match self.repo.object_kind(binding.oid)? {
                            ObjectKind::Commit => self.ref_target_len(),
                            _ => self.repo.blob_size(binding.oid)?,
                        };
                        Ok((
                            self.symlink_attr(ino, size, self.mount_time),
                            self.opts.ref_ttl,
                        ))
                    }
                    ObjectTag::Commit | ObjectTag::Synthetic => Err(Error::StaleInode(ino)),
                }
            }
        }
    }

    /// The full entry stream of a directory, in its stable order.
    ///
    /// Entries whose inode allocation clashed are omitted from the
    /// stream but keep their ordinal, so the offsets of everything
    /// after them never shift.
    pub(crate) fn readdir_entries(&self, ino: u64) -> Result<Vec<DirRecord>> {
        match ino {
            ROOT_INO => Ok(vec![
                DirRecord {
                    offset: 1,
                    ino: COMMITS_INO,
                    kind: FileType::Directory,
                    name: b"commits".to_vec(),
                },
                DirRecord {
                    offset: 2,
                    ino: BRANCHES_INO,
                    kind: FileType::Directory,
                    name: b"branches".to_vec(),
                },
                DirRecord {
                    offset: 3,
                    ino: TAGS_INO,
                    kind: FileType::Directory,
                    name: b"tags".to_vec(),
                },
                DirRecord {
                    offset: 4,
                    ino: HEAD_INO,
                    kind: FileType::Symlink,
                    name: b"HEAD".to_vec(),
                },
            ]),
            // commits are addressed by id only, never enumerated
            COMMITS_INO => Ok(Vec::new()),
            BRANCHES_INO => self.readdir_refs(RefNamespace::Branches),
            TAGS_INO => self.readdir_refs(RefNamespace::Tags),
            HEAD_INO => Err(Error::new_errno(libc::ENOTDIR, "HEAD is not a directory")),
            _ if is_gitlink(ino) => Ok(Vec::new()),
            _ => {
                let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
                if binding.tag != ObjectTag::Tree {
                    return Err(Error::new_errno(libc::ENOTDIR, "not a directory"));
                }
                let entries = self.tree(binding.oid)?;
                let mut records = Vec::with_capacity(entries.len());
                for (index, entry) in entries.iter().enumerate() {
                    let (child, kind) = match entry.mode {
                        EntryMode::Tree => (
                            self.ledger.allocate(&entry.oid, ObjectTag::Tree),
                            FileType::Directory,
                        ),
                        EntryMode::Blob | EntryMode::BlobExecutable => (
                            self.ledger.allocate(&entry.oid, ObjectTag::Blob),
                            FileType::RegularFile,
                        ),
                        EntryMode::Link => (
                            self.ledger.allocate(&entry.oid, ObjectTag::Symlink),
                            FileType::Symlink,
                        ),
                        EntryMode::Commit => (Ok(gitlink_ino(&entry.oid)), FileType::Directory),
                    };
                    let child = match child {
                        Ok(child) => child,
                        Err(err) => {
                            tracing::warn!("omitting colliding directory entry: {err}");
                            continue;
                        }
                    };
                    records.push(DirRecord {
                        offset: index as i64 + 1,
                        ino: child,
                        kind,
                        name: entry.name.clone(),
                    });
                }
                Ok(records)
            }
        }
    }

    fn readdir_refs(&self, namespace: RefNamespace) -> Result<Vec<DirRecord>> {
        let names = self.repo.enumerate_refs(namespace)?;
        let mut records = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let refname = format!("{}{}", namespace.prefix(), name);
            let oid = match self.repo.resolve_ref(&refname) {
                Ok(oid) => oid,
                // refs that do not name a commit are not entries
                Err(_) => continue,
            };
            let ino = match self.ledger.allocate(&oid, ObjectTag::Symlink) {
                Ok(ino) => ino,
                Err(err) => {
                    tracing::warn!("omitting colliding ref entry: {err}");
                    continue;
                }
            };
            records.push(DirRecord {
                offset: index as i64 + 1,
                ino,
                kind: FileType::Symlink,
                name: name.clone().into_bytes(),
            });
        }
        Ok(records)
    }

    /// `readdir` composed with a lookup for each entry.
    pub(crate) fn readdirplus_entries(&self, ino: u64) -> Result<Vec<(DirRecord, EntryOut)>> {
        if !is_root_ino(ino) && !is_gitlink(ino) {
            // tree directories materialize straight from the entry
            // list instead of re-finding every name
            let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
            if binding.tag != ObjectTag::Tree {
                return Err(Error::new_errno(libc::ENOTDIR, "not a directory"));
            }
            let entries = self.tree(binding.oid)?;
            let mut out = Vec::with_capacity(entries.len());
            for (index, entry) in entries.iter().enumerate() {
                match self.materialize_child(ino, entry) {
                    Ok(resolved) => {
                        let record = DirRecord {
                            offset: index as i64 + 1,
                            ino: resolved.attr.ino,
                            kind: resolved.attr.kind,
                            name: entry.name.clone(),
                        };
                        out.push((record, resolved));
                    }
                    Err(err) => {
                        tracing::debug!("omitting directory entry from plus stream: {err}");
                    }
                }
            }
            return Ok(out);
        }
        let records = self.readdir_entries(ino)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            match self.lookup_node(ino, &record.name) {
                Ok(entry) => out.push((record, entry)),
                Err(err) => {
                    tracing::debug!("omitting directory entry from plus stream: {err}");
                }
            }
        }
        Ok(out)
    }

    /// Open a file for reading. The returned handle is the inode
    /// itself; no per-handle state exists to lose across an upgrade.
    pub(crate) fn open_node(&self, ino: u64, flags: i32) -> Result<u64> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(Error::new_errno(libc::EROFS, "filesystem is read-only"));
        }
        if is_root_ino(ino) || is_gitlink(ino) {
            return Err(Error::new_errno(libc::EISDIR, "not a regular file"));
        }
        let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
        match binding.tag {
            ObjectTag::Blob => Ok(ino),
            ObjectTag::Tree => Err(Error::new_errno(libc::EISDIR, "not a regular file")),
            _ => Err(Error::new_errno(libc::EINVAL, "not a regular file")),
        }
    }

    /// Open a directory stream; `fh` is the inode, as for files.
    pub(crate) fn opendir_node(&self, ino: u64) -> Result<u64> {
        match ino {
            ROOT_INO | COMMITS_INO | BRANCHES_INO | TAGS_INO => Ok(ino),
            _ if is_gitlink(ino) => Ok(ino),
            HEAD_INO => Err(Error::new_errno(libc::ENOTDIR, "not a directory")),
            _ => {
                let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
                match binding.tag {
                    ObjectTag::Tree => Ok(ino),
                    _ => Err(Error::new_errno(libc::ENOTDIR, "not a directory")),
                }
            }
        }
    }

    /// Read a byte range out of a blob. Reading past the end yields
    /// an empty slice, not an error.
    pub(crate) fn read_blob(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
        match binding.tag {
            ObjectTag::Blob => (),
            ObjectTag::Tree => return Err(Error::new_errno(libc::EISDIR, "not a regular file")),
            _ => return Err(Error::new_errno(libc::EINVAL, "not a regular file")),
        }
        let data = self.blob(binding.oid)?;
        let offset = offset.max(0) as usize;
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as usize).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    /// The target bytes of a symlink.
    ///
    /// Git symlinks return their blob content verbatim; ref symlinks
    /// point back into `/commits` by full id.
    pub(crate) fn readlink_node(&self, ino: u64) -> Result<Vec<u8>> {
        if ino == HEAD_INO {
            return self.head_target();
        }
        let binding = self.ledger.bound(ino).ok_or(Error::StaleInode(ino))?;
        if binding.tag != ObjectTag::Symlink {
            return Err(Error::new_errno(libc::EINVAL, "not a symlink"));
        }
        match self.repo.object_kind(binding.oid)? {
            ObjectKind::Commit => {
                Ok(format!("{SYMLINK_TARGET_PREFIX}{}", binding.oid).into_bytes())
            }
            ObjectKind::Blob => Ok(self.blob(binding.oid)?.as_ref().clone()),
            _ => Err(Error::GitBackend(format!(
                "symlink inode {ino} bound to unexpected object kind"
            ))),
        }
    }

    /// Synthesized filesystem totals for `statfs`.
    pub(crate) fn statfs_totals(&self) -> (u64, u64) {
        let blocks = self
            .meta
            .iter()
            .map(|entry| (entry.value().size / Self::BLOCK_SIZE as u64) + 1)
            .sum();
        (blocks, self.ledger.len() as u64)
    }
}

fn not_found(name: &[u8]) -> Error {
    Error::new_errno(
        libc::ENOENT,
        format!("no such entry: {}", String::from_utf8_lossy(name)),
    )
}

fn unix_time(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = err.os_error().unwrap_or(libc::EIO);
        tracing::debug!("{err}");
        $reply.error(errno);
        return;
    }};
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives all
/// requests and arranges for their execution on the shared runtime.
/// Every request holds an upgrade-gate guard from dispatch until its
/// reply has been written, which is what the hot-upgrade drain waits
/// on.
pub struct Session {
    fs: Arc<Filesystem>,
    gate: Arc<UpgradeGate>,
    runtime: tokio::runtime::Handle,
}

impl Session {
    /// Construct a new session serving the given filesystem.
    pub fn new(fs: Filesystem, gate: Arc<UpgradeGate>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs: Arc::new(fs),
            gate,
            runtime,
        }
    }
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        const DESIRED: &[(&str, u32)] = &[
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            ("FUSE_CACHE_SYMLINKS", FUSE_CACHE_SYMLINKS),
            ("FUSE_DO_READDIRPLUS", FUSE_DO_READDIRPLUS),
            // the kernel supplies `.` and `..` itself with export
            // support enabled; the resolver never synthesizes them
            ("FUSE_EXPORT_SUPPORT", FUSE_EXPORT_SUPPORT),
            ("FUSE_PARALLEL_DIROPS", FUSE_PARALLEL_DIROPS),
            ("FUSE_READDIRPLUS_AUTO", FUSE_READDIRPLUS_AUTO),
        ];
        let all_desired = DESIRED.iter().fold(0, |prev, (_, i)| prev | i);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = DESIRED
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            config
                .add_capabilities(all_desired & !unsupported)
                .expect("should accept after we remove unsupported caps");
        }
        tracing::info!("filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        let name = name.to_owned();
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            tracing::trace!(parent, name = %name.to_string_lossy(), "lookup");
            let out = unwrap!(reply, fs.lookup_node(parent, name.as_bytes()));
            reply.entry(&out.ttl, &out.attr, 0);
        });
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {
        // bindings are never discarded: the ledger is the collision
        // record and must outlive any kernel reference counts
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            tracing::trace!(ino, "getattr");
            let (attr, ttl) = unwrap!(reply, fs.getattr_node(ino));
            reply.attr(&ttl, &attr);
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            tracing::trace!(ino, "readlink");
            let target = unwrap!(reply, fs.readlink_node(ino));
            reply.data(&target);
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            let fh = unwrap!(reply, fs.open_node(ino, flags));
            tracing::trace!(ino, fh, "open");
            reply.opened(fh, fuser::consts::FOPEN_KEEP_CACHE);
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            let data = unwrap!(reply, fs.read_blob(ino, offset, size));
            tracing::trace!(ino, offset, len = data.len(), "read");
            reply.data(&data);
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // handles are inodes; there is nothing to release
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            let fh = unwrap!(reply, fs.opendir_node(ino));
            tracing::trace!(ino, fh, "opendir");
            reply.opened(fh, 0);
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            tracing::trace!(ino, offset, "readdir");
            let records = unwrap!(reply, fs.readdir_entries(ino));
            for record in records.into_iter().filter(|r| r.offset > offset) {
                let name = OsString::from_vec(record.name);
                if reply.add(record.ino, record.offset, record.kind, &name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            tracing::trace!(ino, offset, "readdirplus");
            let records = unwrap!(reply, fs.readdirplus_entries(ino));
            for (record, entry) in records.into_iter().filter(|(r, _)| r.offset > offset) {
                let name = OsString::from_vec(record.name);
                if reply.add(
                    record.ino,
                    record.offset,
                    &name,
                    &entry.ttl,
                    &entry.attr,
                    0,
                ) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        self.runtime.spawn(async move {
            let _guard = gate.enter().await;
            let (blocks, files) = fs.statfs_totals();
            reply.statfs(
                blocks,
                0,
                0,
                files,
                0,
                Filesystem::BLOCK_SIZE,
                u32::MAX,
                Filesystem::BLOCK_SIZE,
            );
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // a read-only filesystem can hold no dirty data
        reply.ok();
    }

    // every mutation is refused at the boundary, before any
    // resolution work happens

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &std::ffi::OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &std::ffi::OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &std::ffi::OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &std::ffi::OsStr,
        _newparent: u64,
        _newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &std::ffi::OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn removexattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &std::ffi::OsStr,
        _size: u32,
        reply: fuser::ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: fuser::ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }
}
