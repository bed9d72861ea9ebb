//! Port declarations: the descriptor-facing contract a node exposes.

use crate::ident::{PortId, STDERR, STDIN, STDOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Bidir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub direction: Direction,
    pub comment: String,
}

impl PortInfo {
    pub fn new(direction: Direction) -> Self {
        PortInfo {
            direction,
            comment: String::new(),
        }
    }

    pub fn with_comment(direction: Direction, comment: impl Into<String>) -> Self {
        PortInfo {
            direction,
            comment: comment.into(),
        }
    }
}

pub type Ports = BTreeMap<PortId, PortInfo>;

/// Default ports for an `Executable`: stdin in, stdout/stderr out.
pub fn default_executable_ports() -> Ports {
    let mut ports = Ports::new();
    ports.insert(STDIN, PortInfo::new(Direction::In));
    ports.insert(STDOUT, PortInfo::new(Direction::Out));
    ports.insert(STDERR, PortInfo::new(Direction::Out));
    ports
}

/// `System` nodes declare no ports by default; callers add them explicitly
/// when a composite should expose part of its inside to its own parent.
pub fn default_system_ports() -> Ports {
    Ports::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_defaults_match_stdio() {
        let ports = default_executable_ports();
        assert_eq!(ports[&STDIN].direction, Direction::In);
        assert_eq!(ports[&STDOUT].direction, Direction::Out);
        assert_eq!(ports[&STDERR].direction, Direction::Out);
    }

    #[test]
    fn system_defaults_are_empty() {
        assert!(default_system_ports().is_empty());
    }
}
