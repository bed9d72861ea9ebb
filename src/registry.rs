//! Tracks every pipe allocated during one instantiation so forked children
//! can close the ones that belong to siblings rather than to themselves.
//!
//! The source keeps this as a process-wide global set, mutated as pipes are
//! created and destroyed. Per the design notes that accompany this spec, a
//! scoped registry passed explicitly down the instantiation call tree is
//! preferable — the set's lifetime is one `instantiate()` call, not the
//! process's — so this crate threads a `ChannelRegistry` through
//! `instantiate`/`fork_leaf` instead of reaching for a global.

use crate::channel::{Channel, ChannelHandle};
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    pipes: Vec<ChannelHandle>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry { pipes: Vec::new() }
    }

    pub fn register(&mut self, handle: &ChannelHandle) {
        if matches!(&*handle.borrow(), Channel::Pipe(_)) {
            self.pipes.push(Rc::clone(handle));
        }
    }

    /// Every registered pipe not identical to any handle in `keep`.
    pub fn pipes_excluding<'a>(
        &'a self,
        keep: &'a [ChannelHandle],
    ) -> impl Iterator<Item = &'a ChannelHandle> + 'a {
        self.pipes
            .iter()
            .filter(move |candidate| !keep.iter().any(|k| Rc::ptr_eq(k, candidate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn excludes_kept_handles() {
        let mut registry = ChannelRegistry::new();
        let a = Channel::new_pipe().unwrap();
        let b = Channel::new_pipe().unwrap();
        registry.register(&a);
        registry.register(&b);
        let keep = vec![Rc::clone(&a)];
        let remaining: Vec<_> = registry.pipes_excluding(&keep).collect();
        assert_eq!(remaining.len(), 1);
        assert!(Rc::ptr_eq(remaining[0], &b));
    }
}
