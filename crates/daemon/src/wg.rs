//! `wg` command lines shared by every platform driver.

use ipnet::IpNet;
use std::net::SocketAddr;

use crate::platform::args;

/// `wg set <iface> listen-port <port> private-key /dev/stdin`; the key is
/// written to the child's stdin so it never shows up in the process list.
pub fn set_interface_args(interface: &str, listen_port: u16) -> Vec<String> {
    let port = listen_port.to_string();
    args([
        "set",
        interface,
        "listen-port",
        port.as_str(),
        "private-key",
        "/dev/stdin",
    ])
}

/// `wg set <iface> peer <key> [endpoint <ep>] allowed-ips <list> persistent-keepalive <n|off>`
pub fn set_peer_args(
    interface: &str,
    public_key: &str,
    endpoint: Option<SocketAddr>,
    allowed_ips: &[IpNet],
    persistent_keepalive: Option<u16>,
) -> Vec<String> {
    let mut cmd = args(["set", interface, "peer", public_key]);

    if let Some(ep) = endpoint {
        cmd.push("endpoint".to_string());
        cmd.push(ep.to_string());
    }

    let allowed: Vec<String> = allowed_ips.iter().map(IpNet::to_string).collect();
    cmd.push("allowed-ips".to_string());
    cmd.push(allowed.join(","));

    cmd.push("persistent-keepalive".to_string());
    cmd.push(match persistent_keepalive {
        Some(secs) if secs > 0 => secs.to_string(),
        _ => "off".to_string(),
    });
    cmd
}

pub fn remove_peer_args(interface: &str, public_key: &str) -> Vec<String> {
    args(["set", interface, "peer", public_key, "remove"])
}

pub fn show_interface_args(interface: &str) -> Vec<String> {
    args(["show", interface])
}
