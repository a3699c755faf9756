//! Tokio-backed readiness for raw file descriptors.
//!
//! Native drivers usually expose their socket as a file descriptor
//! (`PQsocket`). Wrapping it in [`FdSocket`] registers it with the tokio
//! reactor without taking ownership: the descriptor is still closed by the
//! native handle. Connections drop the socket before closing the handle.

use std::io;
use std::os::unix::io::RawFd;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;

use crate::driver::Socket;

/// A socket registered with the tokio reactor.
pub struct FdSocket {
    fd: AsyncFd<RawFd>,
}

impl FdSocket {
    /// Register `fd` with the current runtime's reactor.
    ///
    /// The descriptor must already be in non-blocking mode.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that stays open, and refers to the
    /// same socket, until the returned `FdSocket` is dropped.
    pub unsafe fn new(fd: RawFd) -> io::Result<Self> {
        // SAFETY: the caller upholds the lifetime contract for `fd`.
        let fd = unsafe { AsyncFd::register(fd) }?;
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        *self.fd.get_ref()
    }
}

impl Socket for FdSocket {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.fd.poll_write_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
