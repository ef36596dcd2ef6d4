//! Host capabilities: tunnel device programming, OS routes, local address
//! discovery.
//!
//! Convergence logic only talks to [`PlatformDriver`]. Each OS gets one driver
//! that shells out to the native tools through a [`CommandRunner`], so the
//! command sequences can be checked without touching the host.

mod darwin;
mod linux;
mod windows;

pub use darwin::DarwinDriver;
pub use linux::LinuxDriver;
pub use windows::WindowsDriver;

use ipnet::IpNet;
use log::debug;
use serde::Serialize;
use std::io::Write;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

impl Os {
    /// The OS this binary was built for, if supported.
    pub fn current() -> Option<Os> {
        if cfg!(target_os = "linux") {
            Some(Os::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Os::Darwin)
        } else if cfg!(target_os = "windows") {
            Some(Os::Windows)
        } else {
            None
        }
    }

    /// Interface name used when none is configured.
    pub fn default_interface(&self) -> &'static str {
        match self {
            Os::Linux => "wg0",
            Os::Darwin => "utun8",
            Os::Windows => "wg0",
        }
    }
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Os::Linux => write!(f, "linux"),
            Os::Darwin => write!(f, "darwin"),
            Os::Windows => write!(f, "windows"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("required tool '{0}' not found in PATH")]
    MissingTool(String),

    #[error("{0} is not supported on {1}")]
    Unsupported(String, Os),

    #[error("local address discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs an external program and returns its stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<String, PlatformError>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<String, PlatformError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("Executing: {}", command);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|source| PlatformError::Spawn {
            command: command.clone(),
            source,
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(PlatformError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Tunnel device capability.
pub trait TunnelDevice {
    fn interface_name(&self) -> &str;

    fn interface_exists(&self) -> Result<bool, PlatformError>;

    /// Tear down any existing interface of this name and create a fresh one.
    fn create_or_replace_interface(
        &self,
        address: &IpNet,
        listen_port: u16,
        private_key: &str,
    ) -> Result<(), PlatformError>;

    fn add_or_replace_peer(
        &self,
        public_key: &str,
        endpoint: Option<SocketAddr>,
        allowed_ips: &[IpNet],
        persistent_keepalive: Option<u16>,
    ) -> Result<(), PlatformError>;

    fn remove_peer(&self, public_key: &str) -> Result<(), PlatformError>;
}

/// OS route table capability. Routes point at the tunnel interface.
pub trait RouteTable {
    fn route_exists(&self, prefix: &IpNet) -> Result<bool, PlatformError>;
    fn add_route(&self, prefix: &IpNet) -> Result<(), PlatformError>;
    fn delete_route(&self, prefix: &IpNet) -> Result<(), PlatformError>;
}

pub trait PlatformDriver: TunnelDevice + RouteTable + Send + Sync {
    fn os(&self) -> Os;

    /// Fail early if the host lacks the tools this driver shells out to.
    fn check_prerequisites(&self) -> Result<(), PlatformError>;

    /// Let the host forward traffic between tunnel peers (hub routers).
    fn enable_forwarding(&self) -> Result<(), PlatformError>;

    /// Source address the host would use to reach `target`.
    fn local_address(&self, target: SocketAddr) -> Result<IpAddr, PlatformError> {
        outbound_address(target)
    }
}

/// Build the native driver for `os`.
pub fn native_driver(os: Os, interface: &str) -> Box<dyn PlatformDriver> {
    match os {
        Os::Linux => Box::new(LinuxDriver::new(interface, SystemRunner)),
        Os::Darwin => Box::new(DarwinDriver::new(interface, SystemRunner)),
        Os::Windows => Box::new(WindowsDriver::new(interface, SystemRunner, default_config_dir())),
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshd")
}

/// Connect a UDP socket (no packets sent) and read back the chosen source.
pub fn outbound_address(target: SocketAddr) -> Result<IpAddr, PlatformError> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket
        .connect(target)
        .map_err(|e| PlatformError::Discovery(format!("no route to {}: {}", target, e)))?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(PlatformError::Discovery(format!(
            "no source address for {}",
            target
        )));
    }
    Ok(ip)
}

/// Look `tool` up in PATH.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .flat_map(|dir| {
            let plain = dir.join(tool);
            let exe = dir.join(format!("{}.exe", tool));
            [plain, exe]
        })
        .find(|candidate| candidate.is_file())
}

fn require_tools(tools: &[&str]) -> Result<(), PlatformError> {
    for tool in tools {
        if find_in_path(tool).is_none() {
            return Err(PlatformError::MissingTool(tool.to_string()));
        }
    }
    Ok(())
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: ToString,
{
    items.into_iter().map(|s| s.to_string()).collect()
}
