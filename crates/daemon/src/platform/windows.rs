use ipnet::IpNet;
use log::{debug, info};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use super::{args, require_tools, CommandRunner, Os, PlatformDriver, PlatformError, RouteTable, TunnelDevice};
use crate::wg;

/// WireGuard for Windows tunnel service, peers through `wg`, routes through `netsh`.
pub struct WindowsDriver<C: CommandRunner> {
    interface: String,
    runner: C,
    config_dir: PathBuf,
}

impl<C: CommandRunner> WindowsDriver<C> {
    pub fn new(interface: &str, runner: C, config_dir: PathBuf) -> Self {
        Self {
            interface: interface.to_string(),
            runner,
            config_dir,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    fn netsh_family(prefix: &IpNet) -> &'static str {
        match prefix {
            IpNet::V4(_) => "ipv4",
            IpNet::V6(_) => "ipv6",
        }
    }
}

/// Tunnel service config; peers are added later with `wg set`.
fn interface_config(address: &IpNet, listen_port: u16, private_key: &str) -> String {
    format!(
        "[Interface]\nPrivateKey = {}\nListenPort = {}\nAddress = {}\n",
        private_key, listen_port, address
    )
}

impl<C: CommandRunner> TunnelDevice for WindowsDriver<C> {
    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn interface_exists(&self) -> Result<bool, PlatformError> {
        match self.runner.run("wg", &wg::show_interface_args(&self.interface), None) {
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
            info!("Uninstalling existing tunnel service {}", self.interface);
            self.runner.run(
                "wireguard",
                &args(["/uninstalltunnelservice", self.interface.as_str()]),
                None,
            )?;
        }

        fs::create_dir_all(&self.config_dir)?;
        let path = self.config_path();
        fs::write(&path, interface_config(address, listen_port, private_key))?;
        debug!("Wrote tunnel config {:?}", path);

        let path_arg = path.to_string_lossy().to_string();
        self.runner.run(
            "wireguard",
            &args(["/installtunnelservice", path_arg.as_str()]),
            None,
        )?;

        info!(
            "Tunnel service {} installed with {} listening on UDP/{}",
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

impl<C: CommandRunner> RouteTable for WindowsDriver<C> {
    fn route_exists(&self, prefix: &IpNet) -> Result<bool, PlatformError> {
        let out = self.runner.run(
            "netsh",
            &args(["interface", Self::netsh_family(prefix), "show", "route"]),
            None,
        )?;
        let net = prefix.to_string();
        Ok(out.lines().any(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            cols.contains(&net.as_str()) && cols.last() == Some(&self.interface.as_str())
        }))
    }

    fn add_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.runner
            .run(
                "netsh",
                &args(["interface", Self::netsh_family(prefix), "add", "route", net.as_str(), self.interface.as_str()]),
                None,
            )
            .map(|_| ())
    }

    fn delete_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let net = prefix.to_string();
        self.runner
            .run(
                "netsh",
                &args(["interface", Self::netsh_family(prefix), "delete", "route", net.as_str(), self.interface.as_str()]),
                None,
            )
            .map(|_| ())
    }
}

impl<C: CommandRunner> PlatformDriver for WindowsDriver<C> {
    fn os(&self) -> Os {
        Os::Windows
    }

    fn check_prerequisites(&self) -> Result<(), PlatformError> {
        require_tools(&["wg", "wireguard", "netsh"])
    }

    fn enable_forwarding(&self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("hub routing".to_string(), Os::Windows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    #[test]
    fn test_interface_config() {
        let conf = interface_config(&"10.0.0.5/32".parse().unwrap(), 51820, "priv=");
        assert!(conf.starts_with("[Interface]\n"));
        assert!(conf.contains("ListenPort = 51820\n"));
        assert!(conf.contains("Address = 10.0.0.5/32\n"));
    }

    #[test]
    fn test_create_writes_config_and_installs() {
        let dir = std::env::temp_dir().join(format!("meshd-win-{}", std::process::id()));
        let driver = WindowsDriver::new(
            "wg0",
            RecordingRunner::new().fail_on("wg show wg0"),
            dir.clone(),
        );
        driver
            .create_or_replace_interface(&"10.0.0.5/32".parse().unwrap(), 51820, "priv=")
            .unwrap();

        let written = fs::read_to_string(dir.join("wg0.conf")).unwrap();
        assert!(written.contains("PrivateKey = priv="));
        let commands = driver.runner.commands();
        assert_eq!(commands[0], "wg show wg0");
        assert!(commands[1].starts_with("wireguard /installtunnelservice"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_route_exists_parses_table() {
        let table = "Publish  Type      Met  Prefix                    Idx  Gateway/Interface Name\n\
                     -------  --------  ---  ------------------------  ---  ------------------------\n\
                     No       Manual    0    10.0.0.0/24                 12  wg0\n";
        let driver = WindowsDriver::new(
            "wg0",
            RecordingRunner::new().respond("netsh interface ipv4 show route", table),
            std::env::temp_dir(),
        );
        assert!(driver.route_exists(&"10.0.0.0/24".parse().unwrap()).unwrap());
        assert!(!driver.route_exists(&"10.1.0.0/24".parse().unwrap()).unwrap());
    }
}
