//! The instance tree produced by instantiation: owns live child processes
//! and channels.

use crate::channel::ChannelHandle;
use crate::fd::OwningDescriptor;
use crate::node::{Environment, Endpoint, Link, NodeName};
use crate::pid::OwningPid;

/// A leaf: a live (or about-to-be-forked) child process.
#[derive(Debug)]
pub struct Forked {
    pub owning_pid: Option<OwningPid>,
    pub diag_stream: OwningDescriptor,
    pub final_status: Option<crate::wait::WaitStatus>,
}

impl Forked {
    pub fn new(diag_stream: OwningDescriptor) -> Self {
        Forked {
            owning_pid: None,
            diag_stream,
            final_status: None,
        }
    }

    /// Reads back whatever the child wrote to its diagnostic stream before
    /// exiting. Empty if the child never wrote anything (the common case:
    /// a clean exec).
    pub fn read_diagnostics(&self) -> std::io::Result<String> {
        use std::io::{Read, Seek, SeekFrom};
        let dup = self
            .diag_stream
            .duplicate()
            .map_err(|_| std::io::Error::from_raw_os_error(-1))?;
        let mut file = unsafe {
            use std::os::unix::io::FromRawFd;
            std::fs::File::from_raw_fd(dup.release())
        };
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

/// An interior node: owns its children and the channel array backing its
/// own links.
///
/// `children` keeps declaration order (see [`crate::node::Nodes`]):
/// `wait` on a `Custom` must visit children in that same order, and
/// `pgrp` is the pid of whichever Executable leaf forked first in that
/// order.
#[derive(Debug)]
pub struct Custom {
    pub pgrp: i32,
    pub children: Vec<(NodeName, Instance)>,
    /// Parallel to `links`: `channels[i]` is the channel `links[i]` resolved
    /// to.
    pub channels: Vec<ChannelHandle>,
    pub links: Vec<Link>,
}

impl Custom {
    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, i)| i)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.children.iter_mut().find(|(n, _)| n == name).map(|(_, i)| i)
    }

    /// The channel backing the link that names a `User` endpoint with the
    /// given name, if any.
    pub fn user_channel(&self, name: &str) -> Option<&ChannelHandle> {
        self.links
            .iter()
            .zip(self.channels.iter())
            .find(|(link, _)| link.endpoints().iter().any(|e| matches!(e, Endpoint::User { name: n } if n == name)))
            .map(|(_, channel)| channel)
    }
}

#[derive(Debug)]
pub enum Info {
    Forked(Forked),
    Custom(Custom),
}

#[derive(Debug)]
pub struct Instance {
    pub environment: Environment,
    pub info: Info,
}

impl Instance {
    pub fn forked(environment: Environment, forked: Forked) -> Self {
        Instance {
            environment,
            info: Info::Forked(forked),
        }
    }

    pub fn custom(environment: Environment, custom: Custom) -> Self {
        Instance {
            environment,
            info: Info::Custom(custom),
        }
    }

    pub fn as_forked(&self) -> Option<&Forked> {
        match &self.info {
            Info::Forked(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&Custom> {
        match &self.info {
            Info::Custom(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_forked_mut(&mut self) -> Option<&mut Forked> {
        match &mut self.info {
            Info::Forked(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_custom_mut(&mut self) -> Option<&mut Custom> {
        match &mut self.info {
            Info::Custom(c) => Some(c),
            _ => None,
        }
    }
}
