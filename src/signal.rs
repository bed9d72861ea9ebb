//! Process-wide SIGINT/SIGTERM delivery counter.
//!
//! Installed once via `sigaction`. The handler itself only increments an
//! atomic counter — nothing else is async-signal-safe here. Waiters poll
//! the counter after `EINTR` to decide whether to forward a signal to the
//! child they're waiting on.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static DELIVERIES: AtomicUsize = AtomicUsize::new(0);
static INSTALL: Once = Once::new();

extern "C" fn on_signal(_: libc::c_int) {
    DELIVERIES.fetch_add(1, Ordering::SeqCst);
}

/// Installs the handler for SIGINT and SIGTERM. Safe to call repeatedly;
/// only the first call takes effect.
///
/// Deliberately omits `SA_RESTART`: `waitpid` is one of the interfaces the
/// kernel auto-restarts when it's set, which would hide the `EINTR` that
/// `wait::wait_pid`'s escalation loop depends on.
pub fn install() {
    INSTALL.call_once(|| {
        let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
        unsafe {
            signal::sigaction(Signal::SIGINT, &action).expect("sigaction(SIGINT)");
            signal::sigaction(Signal::SIGTERM, &action).expect("sigaction(SIGTERM)");
        }
    });
}

pub fn deliveries() -> usize {
    DELIVERIES.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install();
        install();
    }
}
