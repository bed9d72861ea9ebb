//! `WaitStatus`/`WaitResult` and the `waitpid` wrappers built on them.

use crate::instance::{Info, Instance};
use crate::signal;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
pub use nix::sys::wait::WaitPidFlag as WaitFlags;
use nix::sys::wait::{self, WaitStatus as NixWaitStatus};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Unknown,
    Exit { code: i32 },
    Signaled { signal: i32, core_dumped: bool },
    Stopped { signal: i32 },
    Continued,
}

impl WaitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WaitStatus::Exit { .. } | WaitStatus::Signaled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    NoChildren,
    Empty,
    Error { os_errno: i32 },
    Info { pid: i32, status: WaitStatus },
}

impl WaitResult {
    pub fn is_terminal(self) -> bool {
        match self {
            WaitResult::Info { status, .. } => status.is_terminal(),
            WaitResult::NoChildren | WaitResult::Error { .. } => true,
            WaitResult::Empty => false,
        }
    }
}

fn decode(status: NixWaitStatus) -> WaitResult {
    match status {
        NixWaitStatus::Exited(pid, code) => WaitResult::Info {
            pid: pid.as_raw(),
            status: WaitStatus::Exit { code },
        },
        NixWaitStatus::Signaled(pid, sig, core_dumped) => WaitResult::Info {
            pid: pid.as_raw(),
            status: WaitStatus::Signaled {
                signal: sig as i32,
                core_dumped,
            },
        },
        NixWaitStatus::Stopped(pid, sig) => WaitResult::Info {
            pid: pid.as_raw(),
            status: WaitStatus::Stopped { signal: sig as i32 },
        },
        NixWaitStatus::Continued(pid) => WaitResult::Info {
            pid: pid.as_raw(),
            status: WaitStatus::Continued,
        },
        NixWaitStatus::StillAlive => WaitResult::Empty,
        _ => WaitResult::Info {
            pid: -1,
            status: WaitStatus::Unknown,
        },
    }
}

fn from_error(err: nix::Error) -> WaitResult {
    match err.as_errno() {
        Some(Errno::ECHILD) => WaitResult::NoChildren,
        Some(errno) => WaitResult::Error {
            os_errno: errno as i32,
        },
        None => WaitResult::Error { os_errno: -1 },
    }
}

/// Wraps `waitpid`. When `flags` does not request `WNOHANG` the call
/// blocks, and a SIGINT/SIGTERM delivered to this process while blocked
/// escalates: the first delivery forwards `SIGINT` to `pid`, any further
/// delivery forwards `SIGKILL`.
pub fn wait_pid(pid: Pid, flags: WaitFlags) -> WaitResult {
    let blocking = !flags.contains(WaitFlags::WNOHANG);
    if !blocking {
        return match wait::waitpid(pid, Some(flags)) {
            Ok(status) => decode(status),
            Err(err) => from_error(err),
        };
    }

    signal::install();
    let mut seen = signal::deliveries();
    let mut escalated = false;
    loop {
        match wait::waitpid(pid, Some(flags)) {
            Ok(status) => return decode(status),
            Err(nix::Error::Sys(Errno::EINTR)) => {
                let now = signal::deliveries();
                if now != seen {
                    seen = now;
                    let sig = if escalated {
                        Signal::SIGKILL
                    } else {
                        Signal::SIGINT
                    };
                    escalated = true;
                    let _ = kill(pid, sig);
                }
            }
            Err(err) => return from_error(err),
        }
    }
}

/// Waits on every process under `instance`, recursively.
///
/// A `Forked` leaf waits on its own pid (if it was ever forked) and records
/// the terminal status it reaches. A `Custom` node visits its children in
/// insertion order and concatenates their results, so the returned vector
/// reads as a flattened, in-order trace of the whole tree's wait results.
pub fn wait(instance: &mut Instance) -> Vec<WaitResult> {
    match &mut instance.info {
        Info::Forked(forked) => {
            let results = match forked.owning_pid.as_mut() {
                Some(pid) => pid.wait(),
                None => Vec::new(),
            };
            if let Some(status) = results.iter().rev().find_map(|r| match r {
                WaitResult::Info { status, .. } if status.is_terminal() => Some(*status),
                _ => None,
            }) {
                forked.final_status = Some(status);
            }
            results
        }
        Info::Custom(custom) => {
            let mut results = Vec::new();
            for (_, child) in custom.children.iter_mut() {
                results.extend(wait(child));
            }
            results
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exit() {
        let r = decode(NixWaitStatus::Exited(Pid::from_raw(42), 0));
        assert_eq!(
            r,
            WaitResult::Info {
                pid: 42,
                status: WaitStatus::Exit { code: 0 }
            }
        );
    }

    #[test]
    fn decode_signaled() {
        let r = decode(NixWaitStatus::Signaled(
            Pid::from_raw(7),
            Signal::SIGKILL,
            false,
        ));
        assert_eq!(
            r,
            WaitResult::Info {
                pid: 7,
                status: WaitStatus::Signaled {
                    signal: Signal::SIGKILL as i32,
                    core_dumped: false
                }
            }
        );
    }

    #[test]
    fn terminal_classification() {
        assert!(WaitStatus::Exit { code: 0 }.is_terminal());
        assert!(WaitStatus::Signaled {
            signal: 9,
            core_dumped: false
        }
        .is_terminal());
        assert!(!WaitStatus::Stopped { signal: 19 }.is_terminal());
        assert!(!WaitStatus::Continued.is_terminal());
    }
}
