//! The local node's startup state.

use ipnet::IpNet;
use log::{info, warn};
use std::net::{IpAddr, SocketAddr};

use crate::error::{AgentError, AgentResult};
use crate::messages::PeerRecord;
use crate::platform::Os;
use crate::topology::parse_prefix;

/// Facts about this node fixed at startup. The resolver and planner read it;
/// nothing writes it after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNodeState {
    pub device_id: String,
    pub public_key: String,
    pub zone: String,
    pub os: Os,
    pub hub_router: bool,
    pub listen_port: u16,
    /// Tunnel address requested from the coordinator, if any.
    pub requested_address: Option<IpAddr>,
    /// Address advertised to peers as this node's endpoint.
    pub endpoint_ip: IpAddr,
    /// LAN address used by peers behind the same public address.
    pub local_address: Option<IpAddr>,
    pub reflexive_address: Option<IpAddr>,
    pub child_prefixes: Vec<IpNet>,
}

impl LocalNodeState {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.endpoint_ip, self.listen_port)
    }

    /// Record published with the join request.
    pub fn registration_record(&self, symmetric_nat: bool) -> PeerRecord {
        PeerRecord {
            device_id: self.device_id.clone(),
            public_key: Some(self.public_key.clone()),
            zone_id: self.zone.clone(),
            endpoint_ip: self.endpoint().to_string(),
            node_address: self
                .requested_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            child_prefix: self.child_prefixes.iter().map(IpNet::to_string).collect(),
            hub_router: self.hub_router,
            reflexive_address: self
                .reflexive_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            local_address: self
                .local_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            symmetric_nat,
            ..Default::default()
        }
    }
}

/// Endpoint address precedence: operator-provided, then the reflexive address
/// (when reflection is enabled), then the host's own outbound address.
pub fn choose_endpoint_ip(
    user_provided: Option<IpAddr>,
    reflexive: Option<IpAddr>,
    use_reflexive: bool,
    local: Option<IpAddr>,
) -> AgentResult<IpAddr> {
    if let Some(ip) = user_provided {
        info!("Using operator-provided endpoint address {}", ip);
        return Ok(ip);
    }
    if use_reflexive {
        match reflexive {
            Some(ip) => {
                info!("Using reflexive endpoint address {}", ip);
                return Ok(ip);
            }
            None => warn!("No reflexive address discovered, falling back to local address"),
        }
    }
    local
        .map(|ip| {
            info!("Using local endpoint address {}", ip);
            ip
        })
        .ok_or_else(|| AgentError::invalid_address("endpoint", "no endpoint address could be discovered"))
}

/// Validate operator-supplied address inputs.
pub fn validate_inputs(
    requested_address: Option<&str>,
    child_prefixes: &[String],
) -> AgentResult<(Option<IpAddr>, Vec<IpNet>)> {
    let requested = requested_address
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|e| AgentError::invalid_address(s, e))
        })
        .transpose()?;

    let children = child_prefixes
        .iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if !s.contains('/') {
                return Err(AgentError::invalid_address(s, "child prefix must be in CIDR notation"));
            }
            parse_prefix(s).map(|net| net.trunc())
        })
        .collect::<AgentResult<Vec<_>>>()?;

    Ok((requested, children))
}

/// Reject role/OS combinations that cannot work.
pub fn check_supported(os: Os, hub_router: bool) -> AgentResult<()> {
    if hub_router && os != Os::Linux {
        return Err(AgentError::Unsupported(format!(
            "hub router mode is only supported on linux, not {}",
            os
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_endpoint_precedence() {
        let user = Some(ip("203.0.113.9"));
        let refl = Some(ip("198.51.100.1"));
        let local = Some(ip("192.168.1.10"));

        assert_eq!(choose_endpoint_ip(user, refl, true, local).unwrap(), ip("203.0.113.9"));
        assert_eq!(choose_endpoint_ip(None, refl, true, local).unwrap(), ip("198.51.100.1"));
        assert_eq!(choose_endpoint_ip(None, refl, false, local).unwrap(), ip("192.168.1.10"));
        assert_eq!(choose_endpoint_ip(None, None, true, local).unwrap(), ip("192.168.1.10"));
        assert!(choose_endpoint_ip(None, None, true, None).is_err());
    }

    #[test]
    fn test_validate_inputs() {
        let (requested, children) =
            validate_inputs(Some("10.0.0.7"), &["192.168.5.1/24,172.16.0.0/16".to_string()]).unwrap();
        assert_eq!(requested, Some(ip("10.0.0.7")));
        assert_eq!(
            children,
            vec![
                "192.168.5.0/24".parse::<IpNet>().unwrap(),
                "172.16.0.0/16".parse().unwrap()
            ]
        );

        assert!(validate_inputs(Some("10.0.0.300"), &[]).is_err());
        assert!(validate_inputs(None, &["192.168.5.1".to_string()]).is_err());
        assert_eq!(validate_inputs(Some(""), &[]).unwrap(), (None, vec![]));
    }

    #[test]
    fn test_hub_router_only_on_linux() {
        assert!(check_supported(Os::Linux, true).is_ok());
        assert!(check_supported(Os::Darwin, false).is_ok());
        let err = check_supported(Os::Windows, true).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_registration_record() {
        let local = crate::testing::local_node();
        let record = local.registration_record(true);
        assert_eq!(record.device_id, "self");
        assert_eq!(record.endpoint_ip, "198.51.100.100:51820");
        assert!(record.symmetric_nat);
    }
}
