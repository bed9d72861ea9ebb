//! The node tree: pure description, no live resources.

use crate::ident::PortId;
use crate::port::{default_executable_ports, default_system_ports, Ports};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub type NodeName = String;
pub type EnvName = String;
pub type EnvValue = String;
pub type Environment = BTreeMap<EnvName, EnvValue>;

/// Children of a `System`, in declaration order. A plain `BTreeMap` would
/// re-sort by name and silently break the ordering guarantees this spec
/// relies on (insertion-order forking, first-leaf-is-group-leader), so
/// children are kept as an ordered association list instead.
pub type Nodes = Vec<(NodeName, Node)>;

pub fn nodes_get<'a>(nodes: &'a Nodes, name: &str) -> Option<&'a Node> {
    nodes.iter().find(|(n, _)| n == name).map(|(_, node)| node)
}

/// Which node a `NodeEndpoint` names: the enclosing `System` itself, or one
/// of its declared children.
///
/// The original source spells "the system itself" as an endpoint whose
/// node name is empty, reusing `node_name`'s storage as a sentinel. That
/// collides with this crate's non-empty-name invariant for `NodeName`, so
/// self-reference is a distinct variant instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRef {
    SelfRef,
    Child(NodeName),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Unset,
    User { name: String },
    Node {
        node: NodeRef,
        ports: BTreeSet<PortId>,
    },
    File { path: PathBuf },
}

impl Endpoint {
    pub fn node_ref(&self) -> Option<&NodeRef> {
        match self {
            Endpoint::Node { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Endpoint::Unset)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Endpoint::User { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Endpoint::File { .. })
    }
}

/// An unordered pair of endpoints. Two links with `a`/`b` swapped describe
/// the same conduit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl Link {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        Link { a, b }
    }

    /// Both endpoints, as a two-element slice, convenient for symmetric
    /// matching in the resolver.
    pub fn endpoints(&self) -> [&Endpoint; 2] {
        [&self.a, &self.b]
    }

    /// True for the shapes the resolver always rejects regardless of tree
    /// position: both `Unset`, both `User`, or both `File`.
    pub fn is_structurally_invalid(&self) -> bool {
        (self.a.is_unset() && self.b.is_unset())
            || (self.a.is_user() && self.b.is_user())
            || (self.a.is_file() && self.b.is_file())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executable {
    pub file: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub environment: Environment,
    pub nodes: Nodes,
    pub links: Vec<Link>,
}

impl System {
    pub fn get(&self, name: &str) -> Option<&Node> {
        nodes_get(&self.nodes, name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Implementation {
    Executable(Executable),
    System(System),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub ports: Ports,
    pub implementation: Implementation,
}

impl Node {
    pub fn executable(file: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Node {
            ports: default_executable_ports(),
            implementation: Implementation::Executable(Executable {
                file: file.into(),
                arguments,
                working_directory: None,
            }),
        }
    }

    pub fn system(nodes: Nodes, links: Vec<Link>) -> Self {
        Node {
            ports: default_system_ports(),
            implementation: Implementation::System(System {
                environment: Environment::new(),
                nodes,
                links,
            }),
        }
    }

    pub fn as_system(&self) -> Option<&System> {
        match &self.implementation {
            Implementation::System(system) => Some(system),
            _ => None,
        }
    }

    pub fn as_executable(&self) -> Option<&Executable> {
        match &self.implementation {
            Implementation::Executable(executable) => Some(executable),
            _ => None,
        }
    }

    /// Synthesizes one `Link` per declared port, each connecting that port
    /// to a fresh `UserEndpoint` named after the port id. This is the
    /// standard way a caller exposes every port of a node to itself
    /// without hand-writing one link per port.
    pub fn link_with_user(&self) -> Vec<Link> {
        self.ports
            .keys()
            .map(|port_id| {
                Link::new(
                    Endpoint::Node {
                        node: NodeRef::SelfRef,
                        ports: std::iter::once(*port_id).collect(),
                    },
                    Endpoint::User {
                        name: port_id.to_string(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{STDERR, STDIN, STDOUT};

    #[test]
    fn link_with_user_covers_every_port() {
        let node = Node::executable("/bin/ls", vec!["ls".into()]);
        let links = node.link_with_user();
        assert_eq!(links.len(), 3);
        let mut seen = BTreeSet::new();
        for link in &links {
            match &link.a {
                Endpoint::Node { node: NodeRef::SelfRef, ports } => {
                    seen.extend(ports.iter().copied());
                }
                _ => panic!("expected self node endpoint"),
            }
            assert!(link.b.is_user());
        }
        assert_eq!(seen, [STDIN, STDOUT, STDERR].into_iter().collect());
    }

    #[test]
    fn structurally_invalid_shapes() {
        assert!(Link::new(Endpoint::Unset, Endpoint::Unset).is_structurally_invalid());
        assert!(Link::new(
            Endpoint::User { name: "a".into() },
            Endpoint::User { name: "b".into() }
        )
        .is_structurally_invalid());
        assert!(Link::new(
            Endpoint::File { path: "/a".into() },
            Endpoint::File { path: "/b".into() }
        )
        .is_structurally_invalid());
    }
}
