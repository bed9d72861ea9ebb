//! Crate-wide error type.
//!
//! Mirrors the shape of a typical syscall-heavy crate's error enum: one
//! `thiserror` enum, `#[from]` conversions for the handful of lower-level
//! error types we actually propagate, and a `kind()` classifier for callers
//! that want to bucket errors without matching every variant.

#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub enum ErrorKind {
    /// The node tree or a link/port declaration in it was invalid.
    Description,
    /// A syscall or the underlying OS failed in a way the caller can't fix
    /// by changing the node tree.
    System,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A link's shape, endpoints, or referenced names/ports are inconsistent.
    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// A leaf's file path is empty or lacks a filename component.
    #[error("invalid executable: {0}")]
    InvalidExecutable(String),

    /// A declared port is satisfied neither by `available_ports` nor by a
    /// link of the node's parent.
    #[error("invalid port map: {0}")]
    InvalidPortMap(String),

    /// Internal consistency violation, e.g. `parent_links.len() != parent_channels.len()`.
    #[error("logic error: {0}")]
    LogicError(String),

    /// A name violates its identifier's allowed-character rules.
    #[error("charset validation failed for {what}: {value:?}")]
    CharsetValidation { what: &'static str, value: String },

    /// A syscall failed, carrying the raw `errno`.
    #[error("system call failed with errno {code}")]
    Os { code: i32 },

    /// An I/O failure that isn't a raw syscall wrapped by `Os`.
    #[error("io error")]
    Io {
        #[from]
        cause: std::io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidLink(_)
            | Error::InvalidExecutable(_)
            | Error::InvalidPortMap(_)
            | Error::CharsetValidation { .. } => ErrorKind::Description,
            Error::LogicError(_) | Error::Os { .. } | Error::Io { .. } => ErrorKind::System,
        }
    }

    pub fn is_description(&self) -> bool {
        self.kind() == ErrorKind::Description
    }

    pub fn is_system(&self) -> bool {
        self.kind() == ErrorKind::System
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        match err.as_errno() {
            Some(errno) => Error::Os { code: errno as i32 },
            None => Error::Os { code: -1 },
        }
    }
}
