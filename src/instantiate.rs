//! The instantiation engine: walks a `Node` tree, allocates channels for
//! every link, forks leaves in the right order, and rewires each child.

use crate::channel::ChannelHandle;
use crate::error::Error;
use crate::fd::{DiagWriter, OwningDescriptor};
use crate::ident::{validate_env_name, validate_env_value, validate_node_name};
use crate::instance::{Custom, Forked, Instance};
use crate::node::{Environment, Executable, Link, Node, NodeName, NodeRef, System};
use crate::pid::{OwningPid, NO_PID};
use crate::port::Ports;
use crate::registry::ChannelRegistry;
use crate::resolve::{resolve_link, ResolveContext};
use crate::rewire;
use crate::util::{resolve_executable, ResolvedExecutable};
use std::ffi::CString;
use std::io::Write;
use tracing::{debug, info_span};

/// Caller-supplied context for a top-level instantiation: the ports the
/// root node may assume are already satisfied externally, and the base
/// environment every leaf's environment is layered on top of.
#[derive(Debug, Clone, Default)]
pub struct InstantiateOptions {
    pub available_ports: Ports,
    pub base_environment: Environment,
}

pub fn instantiate(node: &Node, options: &InstantiateOptions) -> Result<Instance, Error> {
    validate_environment(&options.base_environment)?;
    let mut registry = ChannelRegistry::new();
    instantiate_rec(
        node,
        &options.base_environment,
        &options.available_ports,
        None,
        &[],
        &[],
        &mut registry,
    )
}

/// Applies the environment-variable charset rules to every name/value in
/// `environment`, surfacing `Error::CharsetValidation` synchronously rather
/// than letting a bad entry reach `execve` in a forked child.
fn validate_environment(environment: &Environment) -> Result<(), Error> {
    for (name, value) in environment {
        validate_env_name(name)?;
        validate_env_value(value)?;
    }
    Ok(())
}

fn validate_closure(
    node: &Node,
    available_ports: &Ports,
    self_name_in_parent: Option<&NodeName>,
    parent_links: &[Link],
) -> Result<(), Error> {
    'port: for (port_id, info) in &node.ports {
        if let Some(external) = available_ports.get(port_id) {
            if external.direction == info.direction {
                continue;
            }
        }
        if let Some(self_name) = self_name_in_parent {
            for link in parent_links {
                for endpoint in link.endpoints() {
                    if let crate::node::Endpoint::Node {
                        node: NodeRef::Child(name),
                        ports,
                    } = endpoint
                    {
                        if name == self_name && ports.contains(port_id) {
                            continue 'port;
                        }
                    }
                }
            }
        }
        return Err(Error::InvalidPortMap(format!(
            "port {} is satisfied neither externally nor by a parent link",
            port_id
        )));
    }
    Ok(())
}

fn instantiate_rec(
    node: &Node,
    env_in: &Environment,
    available_ports: &Ports,
    self_name_in_parent: Option<&NodeName>,
    parent_links: &[Link],
    parent_channels: &[ChannelHandle],
    registry: &mut ChannelRegistry,
) -> Result<Instance, Error> {
    validate_closure(node, available_ports, self_name_in_parent, parent_links)?;

    match &node.implementation {
        crate::node::Implementation::Executable(executable) => {
            let env_out = env_in.clone();
            instantiate_executable_leaf(executable, env_out)
        }
        crate::node::Implementation::System(system) => {
            validate_environment(&system.environment)?;
            let mut env_out = env_in.clone();
            env_out.extend(system.environment.clone());
            instantiate_system(
                system,
                env_out,
                self_name_in_parent,
                parent_links,
                parent_channels,
                registry,
            )
        }
    }
}

fn instantiate_executable_leaf(
    executable: &Executable,
    env_out: Environment,
) -> Result<Instance, Error> {
    if executable.file.file_name().is_none() {
        return Err(Error::InvalidExecutable(format!(
            "{:?} has no filename component",
            executable.file
        )));
    }
    let diag = tempfile::tempfile().map_err(Error::from)?;
    let diag = OwningDescriptor::new({
        use std::os::unix::io::IntoRawFd;
        diag.into_raw_fd()
    });
    diag.set_close_on_exec(true)?;
    Ok(Instance::forked(env_out, Forked::new(diag)))
}

fn instantiate_system(
    system: &System,
    env_out: Environment,
    self_name_in_parent: Option<&NodeName>,
    parent_links: &[Link],
    parent_channels: &[ChannelHandle],
    registry: &mut ChannelRegistry,
) -> Result<Instance, Error> {
    let span = info_span!("instantiate_system");
    let _guard = span.enter();

    for (name, _) in &system.nodes {
        validate_node_name(name)?;
    }

    // Step a: resolve every link of this system into a channel, in order.
    let mut channels = Vec::with_capacity(system.links.len());
    let ctx = ResolveContext {
        self_name_in_parent,
        children: &system.nodes,
        parent_links,
        parent_channels,
    };
    for link in &system.links {
        let channel = resolve_link(link, &ctx)?;
        registry.register(&channel);
        channels.push(channel);
    }

    // Step b: structurally instantiate every child before forking any of
    // them. A nested `System` child forks its own leaves recursively
    // during this call; a nested `Executable` child only gets its
    // placeholder `Forked` here.
    let mut children = Vec::with_capacity(system.nodes.len());
    for (name, child_node) in &system.nodes {
        let child_available_ports = Ports::new();
        let child_instance = instantiate_rec(
            child_node,
            &env_out,
            &child_available_ports,
            Some(name),
            &system.links,
            &channels,
            registry,
        )?;
        children.push((name.clone(), child_node, child_instance));
    }

    // Step c: fork every direct Executable leaf, in insertion order.
    let mut pgrp = NO_PID;
    let mut instantiated = Vec::with_capacity(children.len());
    for (name, child_node, mut instance) in children {
        if let crate::node::Implementation::Executable(executable) = &child_node.implementation {
            let env = instance.environment.clone();
            fork_leaf(
                &name,
                child_node,
                executable,
                &env,
                &system.links,
                &channels,
                registry,
                &mut pgrp,
                &mut instance,
            )?;
        }
        instantiated.push((name, instance));
    }

    close_parent_internal_ends(&system.links, &channels, &system.nodes)?;

    Ok(Instance::custom(
        env_out,
        Custom {
            pgrp,
            children: instantiated,
            channels,
            links: system.links.clone(),
        },
    ))
}

/// After every direct child has been forked, the parent still holds its own
/// copy of every pipe descriptor those children inherited. A descriptor a
/// child owns but the parent never reads or writes must be closed here, or
/// the parent's dangling copy keeps the pipe from ever reporting EOF.
fn close_parent_internal_ends(
    links: &[Link],
    channels: &[ChannelHandle],
    children: &crate::node::Nodes,
) -> Result<(), Error> {
    for (link, channel) in links.iter().zip(channels.iter()) {
        let mut borrowed = channel.borrow_mut();
        let pipe = match &mut *borrowed {
            crate::channel::Channel::Pipe(p) => p,
            _ => continue,
        };
        let a_child = match &link.a {
            crate::node::Endpoint::Node { node: NodeRef::Child(name), ports } => Some((name, ports)),
            _ => None,
        };
        let b_child = match &link.b {
            crate::node::Endpoint::Node { node: NodeRef::Child(name), ports } => Some((name, ports)),
            _ => None,
        };
        match (a_child, b_child) {
            (Some(_), Some(_)) => {
                // Sibling pipe: both ends belong to children, neither is
                // the parent's to keep.
                pipe.close(crate::channel::PipeSide::Read);
                pipe.close(crate::channel::PipeSide::Write);
            }
            (Some((name, ports)), None) | (None, Some((name, ports))) => {
                // One side is a child, the other a User endpoint: close
                // only the side the child kept for itself.
                let direction = crate::resolve::child_port_direction(children, name, ports)?;
                let child_side = match direction {
                    crate::port::Direction::Out => crate::channel::PipeSide::Write,
                    crate::port::Direction::In | crate::port::Direction::Bidir => {
                        crate::channel::PipeSide::Read
                    }
                };
                pipe.close(child_side);
            }
            (None, None) => {
                // Neither side names a child of this system (e.g. a
                // self-to-user pipe): nothing inherited by a fork to close.
            }
        }
    }
    Ok(())
}

fn fork_leaf(
    name: &NodeName,
    node: &Node,
    executable: &Executable,
    env: &Environment,
    links: &[Link],
    channels: &[ChannelHandle],
    registry: &ChannelRegistry,
    pgrp: &mut i32,
    instance: &mut Instance,
) -> Result<(), Error> {
    let path_var = env.get("PATH").cloned();
    let resolved = resolve_executable(&executable.file, path_var.as_deref());

    let forked = match &mut instance.info {
        crate::instance::Info::Forked(f) => f,
        _ => return Err(Error::LogicError("fork_leaf given a non-Forked instance".into())),
    };

    let resolved_path = match resolved {
        ResolvedExecutable::Found(path) => path,
        ResolvedExecutable::NotFound => {
            let _ = forked
                .diag_stream
                .write(format!("executable {:?} not found on PATH\n", executable.file).as_bytes());
            debug!(node = %name, "executable not found on PATH");
            return Ok(());
        }
        ResolvedExecutable::NoPath => {
            let _ = forked.diag_stream.write(b"no PATH to find file\n");
            debug!(node = %name, "no PATH to find file");
            return Ok(());
        }
    };

    // Everything below is prepared before the fork: argv/envp/path buffers
    // and the registry snapshot all need to exist in the parent so the
    // child's copy-on-write view already contains them.
    let path_cstr = cstring_path(&resolved_path)?;
    let mut argv: Vec<CString> = Vec::with_capacity(executable.arguments.len() + 1);
    argv.push(path_cstr.clone());
    for arg in &executable.arguments {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|_| Error::InvalidExecutable("argument contains NUL".into()))?,
        );
    }

    let mut envp: Vec<CString> = Vec::with_capacity(env.len());
    for (k, v) in env {
        envp.push(
            CString::new(format!("{}={}", k, v))
                .map_err(|_| Error::InvalidExecutable("environment entry contains NUL".into()))?,
        );
    }

    let registry_pipes: Vec<ChannelHandle> = registry.pipes_excluding(&[]).cloned().collect();
    let working_directory = executable.working_directory.clone();
    let child_pgrp = *pgrp;
    let diag_fd = forked.diag_stream.as_raw();

    let owning_pid = OwningPid::fork()?;
    if owning_pid.is_child() {
        let mut diag = DiagWriter(diag_fd);
        child_exec(
            name,
            node,
            &path_cstr,
            &argv,
            &envp,
            links,
            channels,
            &registry_pipes,
            working_directory.as_deref(),
            child_pgrp,
            &mut diag,
        );
    }

    if *pgrp == NO_PID {
        *pgrp = owning_pid.raw();
    }
    forked.owning_pid = Some(owning_pid);
    Ok(())
}

fn cstring_path(path: &std::path::Path) -> Result<CString, Error> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidExecutable("path contains NUL".into()))
}

/// Everything that runs in the child between fork and exec. Never returns;
/// exits the process on any failure after writing to `diag`.
fn child_exec(
    name: &NodeName,
    node: &Node,
    path: &CString,
    argv: &[CString],
    envp: &[CString],
    links: &[Link],
    channels: &[ChannelHandle],
    registry_pipes: &[ChannelHandle],
    working_directory: Option<&std::path::Path>,
    pgrp: i32,
    diag: &mut DiagWriter,
) -> ! {
    let target_pgrp = nix::unistd::Pid::from_raw(if pgrp == NO_PID { 0 } else { pgrp });
    let _ = nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), target_pgrp);

    let pid_string = CString::new(std::process::id().to_string()).unwrap();
    let argv: Vec<&std::ffi::CStr> = argv
        .iter()
        .map(|arg| {
            if arg.as_bytes() == b"$$" {
                pid_string.as_c_str()
            } else {
                arg.as_c_str()
            }
        })
        .collect();
    let envp: Vec<&std::ffi::CStr> = envp.iter().map(|e| e.as_c_str()).collect();

    if let Err(err) = rewire::rewire_child(name, node, links, channels, registry_pipes, diag) {
        let _ = writeln!(diag, "rewire failed: {}", err);
        std::process::exit(libc::EXIT_FAILURE);
    }

    if let Some(dir) = working_directory {
        if let Err(err) = nix::unistd::chdir(dir) {
            let _ = writeln!(diag, "chdir {:?} failed: {}", dir, err);
            std::process::exit(libc::EXIT_FAILURE);
        }
    }

    let err = nix::unistd::execve(path, &argv, &envp).unwrap_err();
    let _ = writeln!(diag, "execve {:?} failed: {}", path, err);
    std::process::exit(libc::EXIT_FAILURE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{STDERR as ERR, STDOUT as OUT};
    use crate::node::{Endpoint, NodeRef};
    use crate::port::{Direction, PortInfo};

    #[test]
    fn validate_closure_accepts_externally_provided_port() {
        let mut available = Ports::new();
        available.insert(OUT, PortInfo::new(Direction::Out));
        let node = Node::executable("/bin/ls", vec![]);
        assert!(validate_closure(&node, &available, None, &[]).is_ok());
    }

    #[test]
    fn validate_closure_rejects_dangling_port() {
        let available = Ports::new();
        let mut node = Node::executable("/bin/ls", vec![]);
        node.ports.insert(ERR, PortInfo::new(Direction::Out));
        assert!(validate_closure(&node, &available, None, &[]).is_err());
    }

    #[test]
    fn validate_closure_accepts_port_satisfied_by_parent_link() {
        let available = Ports::new();
        let mut node = Node::executable("/bin/ls", vec![]);
        node.ports.clear();
        node.ports.insert(OUT, PortInfo::new(Direction::Out));
        let parent_links = vec![Link::new(
            Endpoint::Node {
                node: NodeRef::Child("n".into()),
                ports: std::iter::once(OUT).collect(),
            },
            Endpoint::User { name: "out".into() },
        )];
        let name = "n".to_string();
        assert!(validate_closure(&node, &available, Some(&name), &parent_links).is_ok());
    }

    #[test]
    fn executable_without_filename_is_invalid() {
        let executable = Executable {
            file: "/".into(),
            arguments: vec![],
            working_directory: None,
        };
        assert!(instantiate_executable_leaf(&executable, Environment::new()).is_err());
    }

    #[test]
    fn instantiate_rejects_node_name_with_slash() {
        let leaf = Node::executable("/bin/true", vec!["true".into()]);
        let root = Node::system(vec![("bad/name".to_string(), leaf)], vec![]);
        let err = instantiate(&root, &InstantiateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CharsetValidation { .. }));
    }

    #[test]
    fn instantiate_rejects_environment_name_with_equals() {
        let leaf = Node::executable("/bin/true", vec!["true".into()]);
        let mut options = InstantiateOptions::default();
        options
            .base_environment
            .insert("BAD=NAME".to_string(), "x".to_string());
        let err = instantiate(&leaf, &options).unwrap_err();
        assert!(matches!(err, Error::CharsetValidation { .. }));
    }
}
