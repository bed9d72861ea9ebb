//! `OwningDescriptor`: a move-only, drop-closes handle over a raw fd.

use crate::error::Error;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd;
use std::mem::ManuallyDrop;
use std::os::unix::io::RawFd;

pub const INVALID: RawFd = -1;

/// Owns a single OS descriptor. Holds either [`INVALID`] or a descriptor
/// that only this value may close.
#[derive(Debug)]
pub struct OwningDescriptor(RawFd);

impl OwningDescriptor {
    pub fn new(fd: RawFd) -> Self {
        OwningDescriptor(fd)
    }

    pub fn invalid() -> Self {
        OwningDescriptor(INVALID)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    /// Yields the raw descriptor without closing it.
    pub fn release(self) -> RawFd {
        let this = ManuallyDrop::new(self);
        this.0
    }

    /// Explicit close. Returns the errno on failure; idempotent against an
    /// already-invalid handle.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.0 == INVALID {
            return Ok(());
        }
        let fd = self.0;
        self.0 = INVALID;
        unistd::close(fd).map_err(Error::from)
    }

    pub fn set_close_on_exec(&self, yes: bool) -> Result<(), Error> {
        let flags = if yes {
            FdFlag::FD_CLOEXEC
        } else {
            FdFlag::empty()
        };
        fcntl(self.0, FcntlArg::F_SETFD(flags))
            .map(drop)
            .map_err(Error::from)
    }

    pub fn duplicate(&self) -> Result<Self, Error> {
        let fd = unistd::dup(self.0)?;
        Ok(OwningDescriptor(fd))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        unistd::read(self.0, buf).map_err(Error::from)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        unistd::write(self.0, buf).map_err(Error::from)
    }
}

impl Drop for OwningDescriptor {
    fn drop(&mut self) {
        if self.0 != INVALID {
            let _ = unistd::close(self.0);
        }
    }
}

/// A non-owning borrow of a raw fd for writing, used in the window
/// between fork and exec where wrapping the fd in a `File` would hand it
/// a destructor we don't want running in the child.
pub struct DiagWriter(pub RawFd);

impl std::io::Write for DiagWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        unistd::write(self.0, buf)
            .map_err(|e| std::io::Error::from_raw_os_error(e.as_errno().map_or(-1, |e| e as i32)))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_close_is_noop() {
        let mut d = OwningDescriptor::invalid();
        assert!(d.close().is_ok());
        assert!(!d.is_valid());
    }

    #[test]
    fn pipe_round_trip() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let read_fd = OwningDescriptor::new(r);
        let write_fd = OwningDescriptor::new(w);
        write_fd.write(b"hi").unwrap();
        let mut buf = [0u8; 2];
        read_fd.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn release_prevents_close() {
        let (r, w) = nix::unistd::pipe().unwrap();
        drop(OwningDescriptor::new(w));
        let fd = OwningDescriptor::new(r);
        let raw = fd.release();
        assert!(raw >= 0);
        let _ = nix::unistd::close(raw);
    }
}
