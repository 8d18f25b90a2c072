// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! A narrow adapter over the git object store.
//!
//! Everything the filesystem needs from git flows through the
//! [`Repository`] type: commit, tree and blob lookups plus reference
//! resolution and enumeration. All operations are pure reads.

use std::path::{Path, PathBuf};

use gix::bstr::ByteSlice;

pub use gix::ObjectId;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./repo_test.rs"]
mod repo_test;

/// What a commit lookup yields: the root tree and the committer time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    /// The commit's root tree.
    pub tree: ObjectId,
    /// Committer time in seconds since the unix epoch.
    pub committer_time: i64,
}

/// The file mode recorded for one tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// `040000`, a subdirectory.
    Tree,
    /// `100644`, a regular file.
    Blob,
    /// `100755`, a regular file with the executable bit.
    BlobExecutable,
    /// `120000`, a symbolic link whose target is the blob content.
    Link,
    /// `160000`, a submodule gitlink.
    Commit,
}

/// One entry of a decoded tree, in git's canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// The raw entry name.
    pub name: Vec<u8>,
    /// The entry's recorded mode.
    pub mode: EntryMode,
    /// The object the entry points at.
    pub oid: ObjectId,
}

/// The kind of an object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// File content.
    Blob,
    /// A directory snapshot.
    Tree,
    /// A commit.
    Commit,
    /// An annotated tag.
    Tag,
}

/// A namespace of enumerable references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefNamespace {
    /// `refs/heads/`
    Branches,
    /// `refs/tags/`
    Tags,
}

impl RefNamespace {
    /// The full ref prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Branches => "refs/heads/",
            Self::Tags => "refs/tags/",
        }
    }
}

/// Shared handle to an opened git repository.
///
/// The underlying store is thread-safe; each operation materializes a
/// cheap thread-local view, so a single instance can be shared across
/// all worker tasks.
#[derive(Debug)]
pub struct Repository {
    inner: gix::ThreadSafeRepository,
    git_dir: PathBuf,
    hash_len: usize,
}

impl Repository {
    /// Open the repository at the given path (a `.git` directory or a
    /// bare repository).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let repo = gix::ThreadSafeRepository::open(path)
            .map_err(|err| Error::RepositoryOpen(path.to_owned(), Box::new(err)))?;
        let local = repo.to_thread_local();
        let git_dir = local.git_dir().to_owned();
        let hash_len = local.object_hash().len_in_bytes();
        Ok(Self {
            inner: repo,
            git_dir,
            hash_len,
        })
    }

    /// The resolved git directory backing this repository.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The size of this repository's object ids, in bytes (20 or 32).
    pub fn hash_len(&self) -> usize {
        self.hash_len
    }

    /// Parse a full lowercase hex object id of exactly the length this
    /// repository's hash family requires.
    pub fn parse_object_id(&self, name: &str) -> Result<ObjectId> {
        if name.len() != self.hash_len * 2
            || !name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::InvalidCommitId(name.to_owned()));
        }
        ObjectId::from_hex(name.as_bytes())
            .map_err(|_| Error::InvalidCommitId(name.to_owned()))
    }

    /// Look up a commit, returning its root tree and committer time.
    pub fn find_commit(&self, oid: ObjectId) -> Result<CommitInfo> {
        let repo = self.inner.to_thread_local();
        let object = repo.find_object(oid).map_err(|_| Error::UnknownObject(oid))?;
        let commit = object
            .try_into_commit()
            .map_err(|_| Error::UnknownObject(oid))?;
        let tree = commit.tree_id().map_err(Error::git)?.detach();
        let committer_time = commit
            .committer()
            .map_err(Error::git)?
            .time
            .seconds;
        Ok(CommitInfo {
            tree,
            committer_time,
        })
    }

    /// Decode a tree into its entry list, in the order git stores it.
    pub fn find_tree(&self, oid: ObjectId) -> Result<Vec<TreeEntry>> {
        let repo = self.inner.to_thread_local();
        let object = repo.find_object(oid).map_err(|_| Error::UnknownObject(oid))?;
        let tree = object
            .try_into_tree()
            .map_err(|_| Error::UnknownObject(oid))?;
        let mut entries = Vec::new();
        for entry in tree.iter() {
            let entry = entry.map_err(Error::git)?;
            let mode = match entry.inner.mode.kind() {
                gix::object::tree::EntryKind::Tree => EntryMode::Tree,
                gix::object::tree::EntryKind::Blob => EntryMode::Blob,
                gix::object::tree::EntryKind::BlobExecutable => EntryMode::BlobExecutable,
                gix::object::tree::EntryKind::Link => EntryMode::Link,
                gix::object::tree::EntryKind::Commit => EntryMode::Commit,
            };
            entries.push(TreeEntry {
                name: entry.inner.filename.as_bytes().to_owned(),
                mode,
                oid: entry.inner.oid.to_owned(),
            });
        }
        Ok(entries)
    }

    /// Read a blob's full content.
    pub fn find_blob(&self, oid: ObjectId) -> Result<Vec<u8>> {
        let repo = self.inner.to_thread_local();
        let object = repo.find_object(oid).map_err(|_| Error::UnknownObject(oid))?;
        let blob = object
            .try_into_blob()
            .map_err(|_| Error::UnknownObject(oid))?;
        Ok(blob.data.clone())
    }

    /// Report a blob's size without decoding its content.
    pub fn blob_size(&self, oid: ObjectId) -> Result<u64> {
        let repo = self.inner.to_thread_local();
        let header = repo
            .find_header(oid)
            .map_err(|_| Error::UnknownObject(oid))?;
        Ok(header.size())
    }

    /// Report the kind of an object without decoding it.
    pub fn object_kind(&self, oid: ObjectId) -> Result<ObjectKind> {
        let repo = self.inner.to_thread_local();
        let header = repo
            .find_header(oid)
            .map_err(|_| Error::UnknownObject(oid))?;
        Ok(match header.kind() {
            gix::object::Kind::Blob => ObjectKind::Blob,
            gix::object::Kind::Tree => ObjectKind::Tree,
            gix::object::Kind::Commit => ObjectKind::Commit,
            gix::object::Kind::Tag => ObjectKind::Tag,
        })
    }

    /// Resolve `HEAD`, `refs/heads/<name>` or `refs/tags/<name>` to the
    /// commit it names.
    ///
    /// Annotated tags are peeled through to their target; tags that do
    /// not ultimately name a commit do not resolve.
    pub fn resolve_ref(&self, refname: &str) -> Result<ObjectId> {
        let repo = self.inner.to_thread_local();
        let oid = if refname == "HEAD" {
            let mut head = repo.head().map_err(Error::git)?;
            head.try_peel_to_id_in_place()
                .map_err(Error::git)?
                .ok_or_else(|| Error::UnknownReference(refname.to_owned()))?
                .detach()
        } else {
            let mut reference = repo
                .find_reference(refname)
                .map_err(|_| Error::UnknownReference(refname.to_owned()))?;
            reference
                .peel_to_id_in_place()
                .map_err(|_| Error::UnknownReference(refname.to_owned()))?
                .detach()
        };
        match self.object_kind(oid)? {
            ObjectKind::Commit => Ok(oid),
            _ => Err(Error::UnknownReference(refname.to_owned())),
        }
    }

    /// List the short names of all refs in a namespace, in byte order.
    pub fn enumerate_refs(&self, namespace: RefNamespace) -> Result<Vec<String>> {
        let repo = self.inner.to_thread_local();
        let platform = repo.references().map_err(Error::git)?;
        let iter = match namespace {
            RefNamespace::Branches => platform.local_branches().map_err(Error::git)?,
            RefNamespace::Tags => platform.tags().map_err(Error::git)?,
        };
        let prefix = namespace.prefix().as_bytes();
        let mut names = Vec::new();
        for reference in iter {
            let reference = reference.map_err(Error::git)?;
            let full = reference.name().as_bstr();
            let short = full.strip_prefix(prefix).unwrap_or(full.as_bytes());
            names.push(String::from_utf8_lossy(short).into_owned());
        }
        names.sort();
        Ok(names)
    }
}
