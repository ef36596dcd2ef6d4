use ipnet::IpNet;
use log::{debug, info};
use std::net::SocketAddr;
use std::path::PathBuf;

use super::{args, require_tools, CommandRunner, Os, PlatformDriver, PlatformError, RouteTable, TunnelDevice};
use crate::wg;

const SOCKET_DIR: &str = "/var/run/wireguard";

/// Userspace `wireguard-go` on a utun device, configured with `ifconfig`/`route`.
pub struct DarwinDriver<C: CommandRunner> {
    interface: String,
    runner: C,
}

impl<C: CommandRunner> DarwinDriver<C> {
    pub fn new(interface: &str, runner: C) -> Self {
        Self {
            interface: interface.to_string(),
            runner,
        }
    }

    fn control_socket(&self) -> PathBuf {
        PathBuf::from(SOCKET_DIR).join(format!("{}.sock", self.interface))
    }

    fn family_flag(prefix: &IpNet) -> &'static str {
        match prefix {
            IpNet::V4(_) => "-inet",
            IpNet::V6(_) => "-inet6",
        }
    }
}

impl<C: CommandRunner> TunnelDevice for DarwinDriver<C> {
    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn interface_exists(&self) -> Result<bool, PlatformError> {
        match self.runner.run("ifconfig", &args([self.interface.as_str()]), None) {
            Ok(_) => Ok(true),
            Err(PlatformError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_or_replace_interface(
        &self,
        address: &IpNet,
        listen_port: u16,
        private_key: &str,
    ) -> Result<(), PlatformError> {
        if self.interface_exists()? {
            // wireguard-go exits once its control socket disappears
            info!("Tearing down existing interface {}", self.interface);
            let socket = self.control_socket();
            if let Err(e) = std::fs::remove_file(&socket) {
                debug!("Could not remove {:?}: {}", socket, e);
            }
        }

        self.runner.run("wireguard-go", &args([self.interface.as_str()]), None)?;
        self.runner.run(
            "wg",
            &wg::set_interface_args(&self.interface, listen_port),
            Some(private_key),
        )?;

        let host = address.addr().to_string();
        let cidr = address.to_string();
        let family = match address {
            IpNet::V4(_) => "inet",
            IpNet::V6(_) => "inet6",
        };
        self.runner.run(
            "ifconfig",
            &args([self.interface.as_str(), family, cidr.as_str(), host.as_str(), "alias"]),
            None,
        )?;
        self.runner.run("ifconfig", &args([self.interface.as_str(), "up"]), None)?;

        info!(
            "Interface {} up with {} listening on UDP/{}",
            self.interface, address, listen_port
        );
        Ok(())
    }

    fn add_or_replace_peer(
        &self,
        public_key: &str,
        endpoint: Option<SocketAddr>,
        allowed_ips: &[IpNet],
        persistent_keepalive: Option<u16>,
    ) -> Result<(), PlatformError> {
        let argv = wg::set_peer_args(&self.interface, public_key, endpoint, allowed_ips, persistent_keepalive);
        self.runner.run("wg", &argv, None).map(|_| ())
    }

    fn remove_peer(&self, public_key: &str) -> Result<(), PlatformError> {
        self.runner
            .run("wg", &wg::remove_peer_args(&self.interface, public_key), None)
            .map(|_| ())
    }
}

impl<C: CommandRunner> RouteTable for DarwinDriver<C> {
    fn route_exists(&self, prefix: &IpNet) -> Result<bool, PlatformError> {
        let net = prefix.to_string();
        let out = match self.runner.run(
            "route",
            &args(["-n", "get", Self::family_flag(prefix), net.as_str()]),
            None,
        ) {
            Ok(out) => out,
            Err(PlatformError::CommandFailed { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let wanted = format!("interface: {}", self.interface);
        Ok(out.lines().any(|line| line.trim() == wanted))
    }

    fn add_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.runner
            .run(
                "route",
                &args(["-q", "-n", "add", Self::family_flag(prefix), net.as_str(), "-interface", self.interface.as_str()]),
                None,
            )
            .map(|_| ())
    }

    fn delete_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.runner
            .run(
                "route",
                &args(["-q", "-n", "delete", Self::family_flag(prefix), net.as_str(), "-interface", self.interface.as_str()]),
                None,
            )
            .map(|_| ())
    }
}

impl<C: CommandRunner> PlatformDriver for DarwinDriver<C> {
    fn os(&self) -> Os {
        Os::Darwin
    }

    fn check_prerequisites(&self) -> Result<(), PlatformError> {
        require_tools(&["wg", "wireguard-go", "ifconfig", "route"])
    }

    fn enable_forwarding(&self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("hub routing".to_string(), Os::Darwin))
    }
}
