// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Ownership of the kernel FUSE channel.
//!
//! The daemon either opens `/dev/fuse` and mounts it itself, or adopts
//! a descriptor inherited from a previous incarnation across an exec
//! handover. Either way the [`Channel`] holds the descriptor that must
//! survive `execve`, with `FD_CLOEXEC` cleared; the serving session
//! runs on a close-on-exec duplicate.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use gitsnapfs::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::mount::MsFlags;

const DEV_FUSE: &str = "/dev/fuse";

/// The mounted FUSE channel descriptor and its mountpoint.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
    mountpoint: PathBuf,
}

impl Channel {
    /// Open `/dev/fuse` and mount it over `mountpoint`.
    pub fn mount(mountpoint: &Path, allow_other: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEV_FUSE)
            .map_err(|err| Error::new_errno(
                err.raw_os_error().unwrap_or(libc::EIO),
                format!("failed to open {DEV_FUSE}: {err}"),
            ))?;
        let fd: OwnedFd = file.into();

        let uid = nix::unistd::geteuid();
        let gid = nix::unistd::getegid();
        let mut data = format!(
            "fd={},rootmode=40000,user_id={},group_id={},default_permissions",
            fd.as_raw_fd(),
            uid,
            gid,
        );
        if allow_other {
            data.push_str(",allow_other");
        }
        let flags = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        nix::mount::mount(
            Some("gitsnapfs"),
            mountpoint,
            Some("fuse"),
            flags,
            Some(data.as_str()),
        )?;

        let channel = Self {
            fd,
            mountpoint: mountpoint.to_owned(),
        };
        channel.clear_cloexec()?;
        Ok(channel)
    }

    /// Adopt a descriptor inherited from a previous process and skip
    /// the mount syscall; the kernel already holds the mount.
    pub fn adopt(fd: RawFd, mountpoint: PathBuf) -> Result<Self> {
        // validate the descriptor before claiming ownership of it
        fcntl(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            FcntlArg::F_GETFD,
        )
        .map_err(|err| Error::new_errno(err as i32, format!("fd {fd} is not inherited: {err}")))?;
        let channel = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            mountpoint,
        };
        channel.clear_cloexec()?;
        Ok(channel)
    }

    /// The raw descriptor number, as passed through the environment.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The directory this channel is mounted over.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// A close-on-exec duplicate for the serving session, so only the
    /// channel's own descriptor crosses an exec.
    pub fn session_fd(&self) -> Result<OwnedFd> {
        let raw = fcntl(self.fd.as_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Detach the mount. Used on clean shutdown only; an upgrade keeps
    /// the mount alive.
    pub fn unmount(&self) -> Result<()> {
        nix::mount::umount2(&self.mountpoint, nix::mount::MntFlags::MNT_DETACH)?;
        Ok(())
    }

    fn clear_cloexec(&self) -> Result<()> {
        let flags = FdFlag::from_bits_truncate(fcntl(self.fd.as_fd(), FcntlArg::F_GETFD)?);
        if flags.contains(FdFlag::FD_CLOEXEC) {
            fcntl(
                self.fd.as_fd(),
                FcntlArg::F_SETFD(flags.difference(FdFlag::FD_CLOEXEC)),
            )?;
        }
        Ok(())
    }
}
