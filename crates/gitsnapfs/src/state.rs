// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Append-only persistence for the inode collision ledger.
//!
//! The log is a flat sequence of fixed-size little-endian records.
//! It is replayed once at startup and then only ever appended to;
//! a hot upgrade hands the same file to the next process. A torn
//! final record (from a crash mid-append) is dropped on load.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gix::ObjectId;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./state_test.rs"]
mod state_test;

/// The size of one encoded ledger record.
pub const RECORD_LEN: usize = 44;

const FLAG_CLASH: u8 = 0b0000_0001;
const MAX_OID_LEN: usize = 32;

/// One persisted ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// The inode number the object was bound to.
    pub ino: u64,
    /// The raw object-type tag of the binding.
    pub tag: u8,
    /// The winning object id at this inode.
    pub oid: ObjectId,
    /// Whether a different object was later seen at this inode.
    pub clash: bool,
}

impl Record {
    /// Encode this record into its fixed wire form.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&self.ino.to_le_bytes());
        buf[8] = self.tag;
        let oid = self.oid.as_bytes();
        buf[9] = oid.len() as u8;
        buf[10..10 + oid.len()].copy_from_slice(oid);
        buf[42] = if self.clash { FLAG_CLASH } else { 0 };
        buf[43] = 0;
        buf
    }

    /// Decode a record from its fixed wire form.
    ///
    /// `offset` is only used to report where in the log a corrupt
    /// record was found.
    pub fn decode(buf: &[u8; RECORD_LEN], offset: u64) -> Result<Self> {
        let ino = u64::from_le_bytes(buf[0..8].try_into().expect("slice length is fixed"));
        let tag = buf[8];
        let oid_len = buf[9] as usize;
        if oid_len != 20 && oid_len != MAX_OID_LEN {
            return Err(Error::CorruptStateRecord(offset));
        }
        let oid = ObjectId::try_from(&buf[10..10 + oid_len])
            .map_err(|_| Error::CorruptStateRecord(offset))?;
        Ok(Self {
            ino,
            tag,
            oid,
            clash: buf[42] & FLAG_CLASH != 0,
        })
    }
}

/// Single-writer append log backing the inode ledger.
#[derive(Debug)]
pub struct StateLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl StateLog {
    /// Open (or create) the log at `path` and replay its records.
    ///
    /// A partial record at the tail is discarded; the file is clipped
    /// back to the last record boundary so later appends start clean.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<Record>)> {
        let path = path.as_ref().to_owned();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;

        let whole = contents.len() - contents.len() % RECORD_LEN;
        if whole != contents.len() {
            tracing::warn!(
                path = ?path,
                dropped = contents.len() - whole,
                "state log has a torn tail record, discarding it"
            );
            file.set_len(whole as u64)?;
        }

        let mut records = Vec::with_capacity(whole / RECORD_LEN);
        for (index, chunk) in contents[..whole].chunks_exact(RECORD_LEN).enumerate() {
            let buf: &[u8; RECORD_LEN] = chunk.try_into().expect("chunks are record sized");
            records.push(Record::decode(buf, (index * RECORD_LEN) as u64)?);
        }

        file.seek(SeekFrom::End(0))?;
        Ok((
            Self {
                file: Mutex::new(file),
                path,
            },
            records,
        ))
    }

    /// Where this log lives on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Durability is deferred to [`StateLog::sync`].
    pub fn append(&self, record: &Record) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|err| Error::String(format!("state log lock poisoned: {err}")))?;
        file.write_all(&record.encode())?;
        Ok(())
    }

    /// Flush appended records to stable storage.
    ///
    /// Called at quiesce boundaries and immediately before an exec
    /// handover.
    pub fn sync(&self) -> Result<()> {
        let file = self
            .file
            .lock()
            .map_err(|err| Error::String(format!("state log lock poisoned: {err}")))?;
        file.sync_data()?;
        Ok(())
    }
}
