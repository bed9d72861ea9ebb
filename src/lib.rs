/*!
 * This crate instantiates declarative graphs of OS processes: a tree of
 * `Node`s, each either a single executable or a nested `System` wiring
 * its children together with pipes, files and user-facing endpoints.
 *
 * Build a tree with [`node`], hand it to [`instantiate::instantiate`], and
 * get back an [`instance::Instance`] owning the live process group.
 */
pub mod channel;
pub mod error;
pub mod fd;
pub mod ident;
pub mod instance;
pub mod instantiate;
pub mod node;
pub mod pid;
pub mod port;
pub mod registry;
pub mod resolve;
mod rewire;
pub mod signal;
pub mod util;
pub mod wait;

pub use error::{Error, ErrorKind};
pub use instance::{Custom, Forked, Info, Instance};
pub use instantiate::{instantiate, InstantiateOptions};
pub use node::{Endpoint, Executable, Implementation, Link, Node, NodeRef, Nodes, System};
pub use port::{Direction, PortInfo, Ports};
pub use wait::{wait, WaitResult, WaitStatus};
