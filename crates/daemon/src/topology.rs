//! Topology resolution: roster snapshot → desired peer set.
//!
//! For every other roster entry the first matching rule decides how (or
//! whether) the local node peers with it:
//!
//! 1. the local node is the hub router → peer with everyone, keepalive off
//! 2. the entry is the hub router → peer via the zone address range
//! 3. both sides share a reflexive address → peer via LAN addresses
//! 4. neither side behind symmetric NAT → direct, in hub zones too
//! 5. otherwise no entry; traffic reaches the peer through the hub, if any
//!
//! A hub zone without a hub router fails the whole resolution with
//! [`AgentError::NoHubRouterJoined`].

use ipnet::IpNet;
use log::{debug, info, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

use crate::error::{AgentError, AgentResult};
use crate::messages::PeerRecord;
use crate::netcheck::SymmetricNatResult;
use crate::node::LocalNodeState;
use crate::roster::{Roster, RosterStore};

/// How a peer entry is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeeringMode {
    /// Same public address; peered over the shared LAN.
    LocalDirect,
    /// Peered directly via its public endpoint.
    PublicDirect,
    /// Traffic goes through the hub router.
    Relayed,
}

impl std::fmt::Display for PeeringMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeeringMode::LocalDirect => write!(f, "local-direct"),
            PeeringMode::PublicDirect => write!(f, "public-direct"),
            PeeringMode::Relayed => write!(f, "relayed"),
        }
    }
}

/// One peer as the tunnel device should see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPeerConfig {
    pub device_id: String,
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    /// `None` disables keepalive.
    pub persistent_keepalive: Option<u16>,
    pub mode: PeeringMode,
}

impl DesiredPeerConfig {
    /// Whether the device must be reprogrammed to go from `self` to `other`.
    pub fn differs_from(&self, other: &DesiredPeerConfig) -> bool {
        self.public_key != other.public_key
            || self.endpoint != other.endpoint
            || self.allowed_ips != other.allowed_ips
            || self.persistent_keepalive != other.persistent_keepalive
    }
}

/// Resolver output for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub peers: Vec<DesiredPeerConfig>,
    /// Extra routes (child prefixes) beyond each peer's own ranges.
    pub routes: Vec<IpNet>,
}

/// Parse a prefix, accepting a bare address as a host prefix.
pub fn parse_prefix(value: &str) -> AgentResult<IpNet> {
    let value = value.trim();
    if value.contains('/') {
        return value
            .parse::<IpNet>()
            .map_err(|e| AgentError::invalid_address(value, e));
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| AgentError::invalid_address(value, e))
}

/// Parse a comma separated prefix list.
pub fn parse_prefix_list(value: &str) -> AgentResult<Vec<IpNet>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_prefix)
        .collect()
}

/// Ranges a record advertises for itself: `allowed-ips`, else `node-address`.
pub fn advertised_ranges(record: &PeerRecord) -> AgentResult<Vec<IpNet>> {
    let ranges = parse_prefix_list(&record.allowed_ips)?;
    if !ranges.is_empty() {
        return Ok(ranges);
    }
    if record.node_address.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![parse_prefix(&record.node_address)?])
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse().ok()
}

/// Zone range routed through a hub router: the zone prefix's mask applied to
/// the router's own address.
pub fn zone_range(router: &PeerRecord, zone_prefix: &str) -> AgentResult<IpNet> {
    let prefix = zone_prefix
        .trim()
        .parse::<IpNet>()
        .map_err(|_| AgentError::InvalidZonePrefix(zone_prefix.to_string()))?;
    let router_addr = advertised_ranges(router)?
        .first()
        .map(IpNet::addr)
        .ok_or_else(|| AgentError::invalid_address(router.id(), "hub router has no address"))?;
    let range = IpNet::new(router_addr, prefix.prefix_len())
        .map_err(|_| AgentError::InvalidZonePrefix(zone_prefix.to_string()))?;
    Ok(range.trunc())
}

pub struct TopologyResolver {
    keepalive: Option<u16>,
}

impl TopologyResolver {
    pub fn new(keepalive: Option<u16>) -> Self {
        Self { keepalive }
    }

    /// Compute the desired peer set for `roster` as seen from `local`.
    ///
    /// Only cached public keys are used; entries whose key is unknown are
    /// omitted until the key cache catches up.
    pub fn resolve(
        &self,
        roster: &Roster,
        local: &LocalNodeState,
        nat: &SymmetricNatResult,
        store: &RosterStore,
    ) -> AgentResult<Resolution> {
        let hub_zone = roster.entries().any(|e| e.hub_zone);
        let router = roster.entries().find(|e| e.hub_router);
        if hub_zone && router.is_none() {
            return Err(AgentError::NoHubRouterJoined);
        }

        let self_record = roster.entries().find(|e| store.is_self(e.id()));
        let self_is_router = local.hub_router || self_record.is_some_and(|r| r.hub_router);
        let local_reflexive = self_record
            .and_then(|r| parse_ip(&r.reflexive_address))
            .or(local.reflexive_address)
            .or_else(|| nat.reflexive_ip());
        let local_symmetric = nat.is_symmetric();

        // only spokes need the zone range, and only from the router entry
        let hub_range = match router {
            Some(r) if !self_is_router && !store.is_self(r.id()) => {
                let zone_prefix = if r.zone_prefix.trim().is_empty() {
                    roster
                        .entries()
                        .map(|e| e.zone_prefix.as_str())
                        .find(|p| !p.trim().is_empty())
                        .unwrap_or_default()
                } else {
                    r.zone_prefix.as_str()
                };
                if zone_prefix.trim().is_empty() {
                    if hub_zone {
                        return Err(AgentError::InvalidZonePrefix(String::new()));
                    }
                    None
                } else {
                    Some(zone_range(r, zone_prefix)?)
                }
            }
            _ => None,
        };

        let mut resolution = Resolution::default();
        for entry in roster.entries() {
            let id = entry.id();
            if store.is_self(id) {
                continue;
            }
            let Some(public_key) = store.cached_key(id) else {
                warn!("Omitting peer {}: public key not resolved yet", id);
                continue;
            };
            if public_key == local.public_key {
                continue;
            }
            let endpoint = match entry.endpoint_ip.trim().parse::<SocketAddr>() {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    info!(
                        "Omitting peer {}: endpoint '{}' not ready",
                        id, entry.endpoint_ip
                    );
                    continue;
                }
            };
            let own_ranges = match advertised_ranges(entry) {
                Ok(ranges) if !ranges.is_empty() => ranges,
                Ok(_) => {
                    warn!("Omitting peer {}: no advertised address", id);
                    continue;
                }
                Err(e) => {
                    warn!("Omitting peer {}: {}", id, e);
                    continue;
                }
            };
            let children: Vec<IpNet> = entry
                .child_prefix
                .iter()
                .filter_map(|p| match parse_prefix(p) {
                    Ok(net) => Some(net.trunc()),
                    Err(e) => {
                        warn!("Ignoring child prefix of {}: {}", id, e);
                        None
                    }
                })
                .collect();

            let peer_reflexive = parse_ip(&entry.reflexive_address);
            let same_network = local_reflexive.is_some() && local_reflexive == peer_reflexive;

            let (mode, endpoint, mut allowed_ips, keepalive) = if self_is_router {
                (PeeringMode::Relayed, endpoint, own_ranges, None)
            } else if entry.hub_router {
                let ranges = match hub_range {
                    Some(range) => vec![range],
                    None => own_ranges,
                };
                (PeeringMode::Relayed, endpoint, ranges, self.keepalive)
            } else if let (true, Some(lan)) = (same_network, parse_ip(&entry.local_address)) {
                let lan_endpoint = SocketAddr::new(lan, endpoint.port());
                (PeeringMode::LocalDirect, lan_endpoint, own_ranges, self.keepalive)
            } else if !local_symmetric && !entry.symmetric_nat {
                (PeeringMode::PublicDirect, endpoint, own_ranges, self.keepalive)
            } else {
                debug!(
                    "No direct path to {} (local symmetric: {}, peer symmetric: {})",
                    id, local_symmetric, entry.symmetric_nat
                );
                continue;
            };

            for child in children {
                if !allowed_ips.contains(&child) {
                    allowed_ips.push(child);
                }
                if !resolution.routes.contains(&child) {
                    resolution.routes.push(child);
                }
            }

            debug!("Peer {} resolved as {} via {}", id, mode, endpoint);
            resolution.peers.push(DesiredPeerConfig {
                device_id: id.to_string(),
                public_key,
                endpoint: Some(endpoint),
                allowed_ips,
                persistent_keepalive: keepalive,
                mode,
            });
        }

        Ok(resolution)
    }
}
