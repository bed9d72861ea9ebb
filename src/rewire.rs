//! Child-side descriptor rewiring, run between fork and exec.
//!
//! Everything this module touches was allocated by the parent before the
//! fork that produced this child; nothing here grows the heap in a way
//! that would be unsafe in a genuinely async-signal-restricted runtime; it
//! exists so that a real one could be slotted in later without touching
//! the algorithm.

use crate::channel::{Channel, ChannelHandle, PipeSide};
use crate::error::Error;
use crate::fd::OwningDescriptor;
use crate::node::{Endpoint, Link, Node, NodeName, NodeRef};
use crate::port::{Direction, Ports};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::io::Write;

fn node_endpoint_for<'a>(endpoint: &'a Endpoint, child_name: &NodeName) -> Option<&'a std::collections::BTreeSet<u32>> {
    match endpoint {
        Endpoint::Node { node: NodeRef::Child(name), ports } if name == child_name => Some(ports),
        _ => None,
    }
}

fn own_direction(ports: &Ports, port_ids: &std::collections::BTreeSet<u32>) -> Option<Direction> {
    port_ids.iter().find_map(|id| ports.get(id)).map(|info| info.direction)
}

fn rewire_pipe(
    pipe_handle: &ChannelHandle,
    link: &Link,
    child_name: &NodeName,
    child_ports: &Ports,
    diag: &mut impl Write,
) -> Result<(), Error> {
    let a_ports = node_endpoint_for(&link.a, child_name);
    let b_ports = node_endpoint_for(&link.b, child_name);
    let own_ports = a_ports.or(b_ports);

    let own_ports = match own_ports {
        Some(ports) => ports,
        None => {
            // Neither end names this child: this pipe belongs to some
            // other relationship entirely. Must not keep either side open.
            let mut pipe = pipe_handle.borrow_mut();
            if let Channel::Pipe(p) = &mut *pipe {
                p.close(PipeSide::Read);
                p.close(PipeSide::Write);
            }
            return Ok(());
        }
    };

    let direction = own_direction(child_ports, own_ports)
        .ok_or_else(|| Error::LogicError("pipe endpoint names an undeclared port".into()))?;
    let (keep, drop) = match direction {
        Direction::Out => (PipeSide::Write, PipeSide::Read),
        Direction::In | Direction::Bidir => (PipeSide::Read, PipeSide::Write),
    };

    let mut pipe = pipe_handle.borrow_mut();
    if let Channel::Pipe(p) = &mut *pipe {
        p.close(drop);
        for port_id in own_ports {
            writeln!(diag, "dup {:?}-side to fd {}", keep, port_id).ok();
            p.dup_to(keep, *port_id as i32)?;
        }
    }
    Ok(())
}

fn rewire_file(
    file_path: &std::path::Path,
    file_direction: Direction,
    link: &Link,
    child_name: &NodeName,
    diag: &mut impl Write,
) -> Result<(), Error> {
    let own_ports = node_endpoint_for(&link.a, child_name).or_else(|| node_endpoint_for(&link.b, child_name));
    let own_ports = match own_ports {
        Some(ports) => ports,
        None => return Ok(()),
    };

    let flags = match file_direction {
        Direction::In => OFlag::O_RDONLY,
        Direction::Out => OFlag::O_WRONLY,
        Direction::Bidir => OFlag::O_RDWR,
    };
    let fd = open(file_path, flags, Mode::from_bits_truncate(0o600)).map_err(|e| {
        writeln!(diag, "open {} failed", file_path.display()).ok();
        Error::from(e)
    })?;
    let owned = OwningDescriptor::new(fd);
    for port_id in own_ports {
        let new_fd = nix::unistd::dup2(owned.as_raw(), *port_id as i32)?;
        writeln!(diag, "dup2 file fd {} to {}", new_fd, port_id).ok();
    }
    Ok(())
}

/// Closes stdin/stdout/stderr when the node neither declares that port nor
/// is targeted there by a link of its parent.
fn close_unused_stdio(child_name: &NodeName, links: &[Link], child_ports: &Ports) {
    use crate::ident::{STDERR, STDIN, STDOUT};
    let mut used = [
        child_ports.contains_key(&STDIN),
        child_ports.contains_key(&STDOUT),
        child_ports.contains_key(&STDERR),
    ];
    for link in links {
        for endpoint in link.endpoints() {
            if let Some(ports) = node_endpoint_for(endpoint, child_name) {
                if ports.contains(&STDIN) {
                    used[0] = true;
                }
                if ports.contains(&STDOUT) {
                    used[1] = true;
                }
                if ports.contains(&STDERR) {
                    used[2] = true;
                }
            }
        }
    }
    for (used, fd) in used.iter().zip([STDIN, STDOUT, STDERR]) {
        if !*used {
            let _ = nix::unistd::close(fd as i32);
        }
    }
}

/// Runs the full rewiring pass for one child: dereferences every channel,
/// applies pipe/file setup, then closes any registry pipe this child
/// doesn't own an end of, then closes undeclared stdio.
pub fn rewire_child(
    child_name: &NodeName,
    child_node: &Node,
    links: &[Link],
    channels: &[ChannelHandle],
    registry_pipes: &[ChannelHandle],
    diag: &mut impl Write,
) -> Result<(), Error> {
    let mut kept = Vec::new();
    for (link, channel) in links.iter().zip(channels.iter()) {
        let concrete = Channel::deref_chain(channel)?;
        let is_pipe = matches!(&*concrete.borrow(), Channel::Pipe(_));
        if is_pipe {
            rewire_pipe(&concrete, link, child_name, &child_node.ports, diag)?;
            kept.push(concrete.clone());
        } else {
            let file_info = match &*concrete.borrow() {
                Channel::File(f) => Some((f.path.clone(), f.direction)),
                _ => None,
            };
            if let Some((path, direction)) = file_info {
                rewire_file(&path, direction, link, child_name, diag)?;
            }
        }
    }

    for pipe in registry_pipes {
        if kept.iter().any(|k| std::rc::Rc::ptr_eq(k, pipe)) {
            continue;
        }
        if let Channel::Pipe(p) = &mut *pipe.borrow_mut() {
            p.close(PipeSide::Read);
            p.close(PipeSide::Write);
        }
    }

    close_unused_stdio(child_name, links, &child_node.ports);
    Ok(())
}
