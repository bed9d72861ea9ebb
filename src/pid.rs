//! `OwningPid`: a move-only handle over a forked child, reaped on drop.

use crate::error::Error;
use crate::wait::{self, WaitResult, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::warn;

pub const NO_PID: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not yet known to have exited or been signaled.
    Live,
    /// A terminal status has already been observed; drop must not wait again.
    Reaped,
}

/// Owns a live child pid. Holds either `no_pid` or a pid this value alone
/// may wait on. Drop blocks until a terminal status (`Exit`/`Signaled`) is
/// observed unless the pid was already reaped via [`OwningPid::wait`].
#[derive(Debug)]
pub struct OwningPid {
    pid: i32,
    state: State,
}

impl OwningPid {
    /// Forks the calling process. In the child this returns an `OwningPid`
    /// wrapping `no_pid`; in the parent it wraps the child's pid.
    pub fn fork() -> Result<Self, Error> {
        match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => Ok(OwningPid {
                pid: child.as_raw(),
                state: State::Live,
            }),
            ForkResult::Child => Ok(OwningPid {
                pid: NO_PID,
                state: State::Reaped,
            }),
        }
    }

    pub fn is_child(&self) -> bool {
        self.pid == NO_PID
    }

    pub fn raw(&self) -> i32 {
        self.pid
    }

    /// Waits until a terminal status is observed, appending every
    /// intermediate (`Stopped`/`Continued`) result along the way. Marks
    /// this handle reaped so drop does not wait again.
    pub fn wait(&mut self) -> Vec<WaitResult> {
        if self.pid == NO_PID || self.state == State::Reaped {
            return Vec::new();
        }
        let mut results = Vec::new();
        loop {
            let result = wait::wait_pid(Pid::from_raw(self.pid), wait::WaitFlags::empty());
            let terminal = matches!(
                result,
                WaitResult::Info {
                    status: WaitStatus::Exit { .. },
                    ..
                } | WaitResult::Info {
                    status: WaitStatus::Signaled { .. },
                    ..
                } | WaitResult::NoChildren
                    | WaitResult::Error { .. }
            );
            results.push(result);
            if terminal {
                self.state = State::Reaped;
                break;
            }
        }
        results
    }
}

impl Drop for OwningPid {
    fn drop(&mut self) {
        if self.pid != NO_PID && self.state == State::Live {
            let _ = self.wait();
            if self.state != State::Reaped {
                warn!(pid = self.pid, "OwningPid dropped without terminal status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pid_wait_is_empty() {
        let mut p = OwningPid {
            pid: NO_PID,
            state: State::Live,
        };
        assert!(p.wait().is_empty());
    }
}
