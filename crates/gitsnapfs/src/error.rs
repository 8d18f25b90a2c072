// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while serving git data as a filesystem.
#[derive(Debug, Error)]
pub enum Error {
    /// A free-form error message.
    #[error("{0}")]
    String(String),
    /// An underlying OS error from the nix crate.
    #[error(transparent)]
    Nix(#[from] nix::Error),
    /// An underlying io error.
    #[error(transparent)]
    IO(#[from] io::Error),
    /// A message paired with an explicit errno for the kernel reply.
    #[error("[ERRNO {1}] {0}")]
    Errno(String, i32),
    /// Failure to load or parse the runtime configuration.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// The named repository could not be opened.
    #[error("failed to open repository at {0:?}")]
    RepositoryOpen(PathBuf, #[source] Box<gix::open::Error>),
    /// The git object store failed in a way that is not "not found".
    #[error("git backend error: {0}")]
    GitBackend(String),
    /// The requested object does not exist in the object store.
    #[error("unknown object {0}")]
    UnknownObject(gix::ObjectId),
    /// The requested reference does not exist or does not point at a commit.
    #[error("unknown reference {0:?}")]
    UnknownReference(String),
    /// The given name is not a full lowercase hex object id.
    #[error("invalid commit id {0:?}")]
    InvalidCommitId(String),

    /// Two distinct objects truncate to the same inode number.
    #[error("inode {0} already bound to a different object")]
    InodeClash(u64),
    /// An inode that is neither synthetic nor present in the ledger.
    #[error("inode {0} is not bound")]
    StaleInode(u64),
    /// The state log contains a record that cannot be decoded.
    #[error("corrupt state log record at offset {0}")]
    CorruptStateRecord(u64),
}

impl Error {
    /// Create a new error with the given message.
    pub fn new<S: AsRef<str>>(message: S) -> Error {
        Error::String(message.as_ref().to_owned())
    }

    /// Create an error carrying a specific errno.
    pub fn new_errno<E: Into<String>>(errno: i32, e: E) -> Error {
        Error::Errno(e.into(), errno)
    }

    /// Wrap a fallible git backend call, mapping its error to [`Error::GitBackend`].
    pub fn git<E: std::fmt::Display>(err: E) -> Error {
        Error::GitBackend(err.to_string())
    }

    /// The errno that best represents this error to the kernel, if any.
    ///
    /// Name resolution failures surface as `ENOENT`, inode collisions as
    /// `EUCLEAN`, and unbound inodes as `ESTALE`. Everything that reaches
    /// the kernel without a mapping is reported as `EIO` by the caller.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::UnknownObject(_)
            | Error::UnknownReference(_)
            | Error::InvalidCommitId(_) => Some(libc::ENOENT),
            Error::InodeClash(_) => Some(libc::EUCLEAN),
            Error::StaleInode(_) => Some(libc::ESTALE),
            Error::GitBackend(_) | Error::CorruptStateRecord(_) => Some(libc::EIO),
            Error::Errno(_, errno) => Some(*errno),
            Error::IO(err) => err.raw_os_error().or(Some(libc::EIO)),
            Error::Nix(err) => Some(*err as i32),
            _ => None,
        }
    }
}

/// A result type for fallible gitsnapfs operations.
pub type Result<T> = std::result::Result<T, Error>;
