// src/kms/fence.rs

//! Owned sync-file descriptors.
//!
//! A `FenceFd` closes its descriptor when dropped. Handing it to the
//! kernel or to the GPU driver is expressed by moving it (into a
//! `CommitRequest`, or into `RenderContext::import_fence`) or by
//! `into_raw`, after which the caller no longer owns the descriptor.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::trace;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Which side signals the fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Signaled when GPU rendering of a frame finishes; consumed by the display.
    GpuCompletion,
    /// Signaled when a commit's scanout resources are free; consumed by the GPU side.
    DisplayCompletion,
}

#[derive(Debug)]
pub struct FenceFd {
    fd: OwnedFd,
    kind: FenceKind,
}

impl FenceFd {
    pub fn new(fd: OwnedFd, kind: FenceKind) -> Self {
        FenceFd { fd, kind }
    }

    /// Takes ownership of a raw descriptor. `-1` (no fence) yields `None`.
    ///
    /// # Safety
    /// `raw` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw(raw: RawFd, kind: FenceKind) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        Some(FenceFd {
            fd: OwnedFd::from_raw_fd(raw),
            kind,
        })
    }

    pub fn kind(&self) -> FenceKind {
        self.kind
    }

    /// Gives up ownership; the descriptor will not be closed by this value.
    pub fn into_raw(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Blocks until the fence signals or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(limit) => PollTimeout::from(u16::try_from(limit.as_millis()).unwrap_or(u16::MAX)),
        };
        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    trace!("{:?} fence {} signaled", self.kind, self.fd.as_raw_fd());
                    return Ok(true);
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn is_signaled(&self) -> io::Result<bool> {
        self.wait(Some(Duration::ZERO))
    }
}

impl AsFd for FenceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for FenceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
