use ipnet::IpNet;
use log::{info, warn};
use std::net::SocketAddr;

use super::{args, require_tools, CommandRunner, Os, PlatformDriver, PlatformError, RouteTable, TunnelDevice};
use crate::wg;

/// Kernel WireGuard driven through `ip` and `wg`.
pub struct LinuxDriver<C: CommandRunner> {
    interface: String,
    runner: C,
}

impl<C: CommandRunner> LinuxDriver<C> {
    pub fn new(interface: &str, runner: C) -> Self {
        Self {
            interface: interface.to_string(),
            runner,
        }
    }

    fn ip(&self, argv: Vec<String>) -> Result<String, PlatformError> {
        self.runner.run("ip", &argv, None)
    }

    fn family_flag(prefix: &IpNet) -> &'static str {
        match prefix {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        }
    }
}

impl<C: CommandRunner> TunnelDevice for LinuxDriver<C> {
    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn interface_exists(&self) -> Result<bool, PlatformError> {
        match self.ip(args(["link", "show", "dev", self.interface.as_str()])) {
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
            info!("Deleting existing interface {}", self.interface);
            self.ip(args(["link", "del", "dev", self.interface.as_str()]))?;
        }

        self.ip(args(["link", "add", "dev", self.interface.as_str(), "type", "wireguard"]))?;
        self.runner.run(
            "wg",
            &wg::set_interface_args(&self.interface, listen_port),
            Some(private_key),
        )?;
        let addr = address.to_string();
        self.ip(args(["address", "add", addr.as_str(), "dev", self.interface.as_str()]))?;
        self.ip(args(["link", "set", self.interface.as_str(), "up"]))?;

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

impl<C: CommandRunner> RouteTable for LinuxDriver<C> {
    fn route_exists(&self, prefix: &IpNet) -> Result<bool, PlatformError> {
        let net = prefix.to_string();
        let out = self.ip(args([
            Self::family_flag(prefix),
            "route",
            "show",
            "exact",
            net.as_str(),
            "dev",
            self.interface.as_str(),
        ]))?;
        Ok(!out.trim().is_empty())
    }

    fn add_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.ip(args([Self::family_flag(prefix), "route", "add", net.as_str(), "dev", self.interface.as_str()]))
            .map(|_| ())
    }

    fn delete_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.ip(args([Self::family_flag(prefix), "route", "del", net.as_str(), "dev", self.interface.as_str()]))
            .map(|_| ())
    }
}

impl<C: CommandRunner> PlatformDriver for LinuxDriver<C> {
    fn os(&self) -> Os {
        Os::Linux
    }

    fn check_prerequisites(&self) -> Result<(), PlatformError> {
        require_tools(&["ip", "wg"])
    }

    fn enable_forwarding(&self) -> Result<(), PlatformError> {
        for key in ["net.ipv4.ip_forward=1", "net.ipv6.conf.all.forwarding=1"] {
            if let Err(e) = self.runner.run("sysctl", &args(["-w", key]), None) {
                warn!("Failed to set {}: {}", key, e);
                if key.starts_with("net.ipv4") {
                    return Err(e);
                }
            }
        }

        // traffic arriving on the tunnel must be forwarded even under a DROP policy
        let rule = ["FORWARD", "-i", self.interface.as_str(), "-j", "ACCEPT"];
        let mut check = vec!["-C".to_string()];
        check.extend(args(rule));
        if self.runner.run("iptables", &check, None).is_ok() {
            return Ok(());
        }
        let mut append = vec!["-A".to_string()];
        append.extend(args(rule));
        match self.runner.run("iptables", &append, None) {
            Ok(_) => info!("Accepting forwarded traffic from {}", self.interface),
            Err(e) => warn!("Forward rule for {} was not added: {}", self.interface, e),
        }
        Ok(())
    }
}
