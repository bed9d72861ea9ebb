//! The channel model: concrete runtime artifacts that back a resolved link.

use crate::error::Error;
use crate::fd::OwningDescriptor;
use crate::port::Direction;
use std::rc::{Rc, Weak};
use std::cell::RefCell;
use std::thread::JoinHandle;
use tracing::debug;

pub type ChannelHandle = Rc<RefCell<Channel>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    Read,
    Write,
}

/// An anonymous pipe. Either end may independently be closed; closing both
/// detaches the channel from any descriptor.
#[derive(Debug)]
pub struct PipeChannel {
    read: OwningDescriptor,
    write: OwningDescriptor,
}

impl PipeChannel {
    pub fn new() -> Result<Self, Error> {
        let (r, w) = nix::unistd::pipe().map_err(|e| match e.as_errno() {
            Some(nix::errno::Errno::EMFILE) | Some(nix::errno::Errno::ENFILE) => {
                Error::Os { code: nix::errno::Errno::EMFILE as i32 }
            }
            _ => Error::from(e),
        })?;
        Ok(PipeChannel {
            read: OwningDescriptor::new(r),
            write: OwningDescriptor::new(w),
        })
    }

    pub fn close(&mut self, side: PipeSide) {
        let descriptor = match side {
            PipeSide::Read => &mut self.read,
            PipeSide::Write => &mut self.write,
        };
        if let Err(err) = descriptor.close() {
            debug!(?side, ?err, "pipe close failed");
        }
    }

    pub fn is_closed(&self, side: PipeSide) -> bool {
        match side {
            PipeSide::Read => !self.read.is_valid(),
            PipeSide::Write => !self.write.is_valid(),
        }
    }

    /// Duplicates `side`'s descriptor onto `target_fd`, replacing whatever
    /// occupied that slot.
    pub fn dup_to(&mut self, side: PipeSide, target_fd: i32) -> Result<(), Error> {
        let descriptor = match side {
            PipeSide::Read => &mut self.read,
            PipeSide::Write => &mut self.write,
        };
        let new_fd = nix::unistd::dup2(descriptor.as_raw(), target_fd)?;
        *descriptor = OwningDescriptor::new(new_fd);
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.read.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.write.write(buf)
    }

    pub fn read_fd(&self) -> i32 {
        self.read.as_raw()
    }

    pub fn write_fd(&self) -> i32 {
        self.write.as_raw()
    }
}

/// Metadata only; the child materializes the open file during rewiring.
#[derive(Debug, Clone)]
pub struct FileChannel {
    pub path: std::path::PathBuf,
    pub direction: Direction,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardingCounters {
    pub reads: u64,
    pub writes: u64,
    pub bytes: u64,
}

/// Owns a source and destination descriptor and a background thread that
/// copies bytes until EOF on the source.
pub struct ForwardingChannel {
    source: OwningDescriptor,
    destination: OwningDescriptor,
    worker: Option<JoinHandle<Result<ForwardingCounters, Error>>>,
}

impl std::fmt::Debug for ForwardingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingChannel")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish()
    }
}

impl ForwardingChannel {
    pub fn new(source: OwningDescriptor, destination: OwningDescriptor) -> Self {
        let source_fd = source.as_raw();
        let destination_fd = destination.as_raw();
        let worker = std::thread::spawn(move || forward_loop(source_fd, destination_fd));
        ForwardingChannel {
            source,
            destination,
            worker: Some(worker),
        }
    }

    /// Joins the background worker and returns its final counters.
    pub fn result(&mut self) -> Result<ForwardingCounters, Error> {
        match self.worker.take() {
            Some(handle) => handle.join().unwrap_or(Ok(ForwardingCounters::default())),
            None => Ok(ForwardingCounters::default()),
        }
    }

    pub fn source_fd(&self) -> i32 {
        self.source.as_raw()
    }

    pub fn destination_fd(&self) -> i32 {
        self.destination.as_raw()
    }
}

impl Drop for ForwardingChannel {
    fn drop(&mut self) {
        // Join before `source`/`destination` drop-close: the worker only
        // borrows those fd numbers, it doesn't own them, so the fds must
        // stay open until it's done with them.
        let _ = self.result();
    }
}

/// Copies `source_fd` to `destination_fd` until EOF, using the raw fd
/// numbers directly rather than wrapping them in owning `File`s: the
/// `OwningDescriptor`s on `ForwardingChannel` are the sole owners of these
/// fds, and a second close (from a `File`'s destructor racing the
/// `ForwardingChannel`'s) could hit an unrelated fd the OS has since
/// reused.
fn forward_loop(source_fd: i32, destination_fd: i32) -> Result<ForwardingCounters, Error> {
    let mut counters = ForwardingCounters::default();
    let mut buf = [0u8; 4096];
    loop {
        let n = nix::unistd::read(source_fd, &mut buf).map_err(Error::from)?;
        counters.reads += 1;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            let w = nix::unistd::write(destination_fd, &buf[written..n]).map_err(Error::from)?;
            written += w;
            counters.writes += 1;
            counters.bytes += w as u64;
        }
    }
    Ok(counters)
}

/// A signal endpoint: the channel carries no descriptors, only the signal
/// number a link negotiated to deliver.
#[derive(Debug, Clone, Copy)]
pub struct SignalChannel {
    pub signal: i32,
}

/// Tagged union of every concrete channel kind.
#[derive(Debug)]
pub enum Channel {
    Pipe(PipeChannel),
    File(FileChannel),
    Forwarding(ForwardingChannel),
    Signal(SignalChannel),
    /// Non-owning indirection to a channel owned further up the instance
    /// tree. `Weak` is the safe-Rust analogue of the index-based lookup
    /// the resolver's referenced design calls for: it never extends the
    /// referent's lifetime, upgrading fails cleanly if the parent has
    /// already been torn down, and a chain of references is just a chain
    /// of `upgrade()` calls regardless of how many ancestors deep it goes.
    Reference(Weak<RefCell<Channel>>),
}

impl Channel {
    pub fn new_pipe() -> Result<ChannelHandle, Error> {
        Ok(Rc::new(RefCell::new(Channel::Pipe(PipeChannel::new()?))))
    }

    pub fn new_file(path: std::path::PathBuf, direction: Direction) -> ChannelHandle {
        Rc::new(RefCell::new(Channel::File(FileChannel { path, direction })))
    }

    pub fn new_reference(target: &ChannelHandle) -> ChannelHandle {
        Rc::new(RefCell::new(Channel::Reference(Rc::downgrade(target))))
    }

    /// Fully dereferences a chain of `Reference` channels. Returns the
    /// concrete handle at the end of the chain.
    pub fn deref_chain(handle: &ChannelHandle) -> Result<ChannelHandle, Error> {
        let mut current = Rc::clone(handle);
        loop {
            let next = match &*current.borrow() {
                Channel::Reference(weak) => Some(
                    weak.upgrade()
                        .ok_or_else(|| Error::LogicError("dangling reference channel".into()))?,
                ),
                _ => None,
            };
            match next {
                Some(n) => current = n,
                None => return Ok(current),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trips_bytes() {
        let pipe = PipeChannel::new().unwrap();
        pipe.write(b"hello").unwrap();
        let mut buf = [0u8; 5];
        pipe.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn pipe_close_is_idempotent() {
        let mut pipe = PipeChannel::new().unwrap();
        pipe.close(PipeSide::Read);
        assert!(pipe.is_closed(PipeSide::Read));
        pipe.close(PipeSide::Read);
        assert!(pipe.is_closed(PipeSide::Read));
    }

    #[test]
    fn reference_chain_dereferences_to_concrete() {
        let base = Channel::new_pipe().unwrap();
        let middle = Channel::new_reference(&base);
        let outer = Channel::new_reference(&middle);
        let resolved = Channel::deref_chain(&outer).unwrap();
        assert!(matches!(&*resolved.borrow(), Channel::Pipe(_)));
    }

    #[test]
    fn dangling_reference_is_logic_error() {
        let handle;
        {
            let base = Channel::new_pipe().unwrap();
            handle = Channel::new_reference(&base);
        }
        assert!(Channel::deref_chain(&handle).is_err());
    }

    #[test]
    fn forwarding_channel_copies_to_eof() {
        let (src_r, src_w) = nix::unistd::pipe().unwrap();
        let (dst_r, dst_w) = nix::unistd::pipe().unwrap();
        let mut fwd = ForwardingChannel::new(OwningDescriptor::new(src_r), OwningDescriptor::new(dst_w));
        nix::unistd::write(src_w, b"payload").unwrap();
        nix::unistd::close(src_w).unwrap();
        let counters = fwd.result().unwrap();
        assert_eq!(counters.bytes, 7);
        let mut buf = [0u8; 7];
        nix::unistd::read(dst_r, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        nix::unistd::close(dst_r).unwrap();
    }
}
