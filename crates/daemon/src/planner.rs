//! Local interface planning: what address and port the tunnel device needs.

use ipnet::IpNet;
use log::info;

use crate::error::{AgentError, AgentResult};
use crate::node::LocalNodeState;
use crate::roster::{Roster, RosterStore};
use crate::topology::advertised_ranges;

/// Well-known WireGuard port; hub routers always listen here so spokes can
/// reach them without learning a port.
pub const WG_DEFAULT_PORT: u16 = 51820;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub address: IpNet,
    pub listen_port: u16,
    pub hub_router: bool,
    /// The roster moved this node to a new address; the interface must be
    /// recreated before any peer is programmed.
    pub address_changed: bool,
}

/// Plan the local interface from the node's own roster record.
pub fn plan(
    roster: &Roster,
    local: &LocalNodeState,
    store: &RosterStore,
    applied_address: Option<&IpNet>,
) -> AgentResult<InterfaceConfig> {
    let record = roster
        .entries()
        .find(|e| store.is_self(e.id()))
        .ok_or_else(|| AgentError::NotInRoster(local.device_id.clone()))?;

    let assigned = advertised_ranges(record)?
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::invalid_address(record.id(), "no tunnel address assigned"))?;

    let hub_router = local.hub_router || record.hub_router;

    // a hub router owns the whole zone range on its interface
    let address = match (hub_router, record.zone_prefix.trim()) {
        (true, prefix) if !prefix.is_empty() => {
            let zone: IpNet = prefix
                .parse()
                .map_err(|_| AgentError::InvalidZonePrefix(prefix.to_string()))?;
            IpNet::new(assigned.addr(), zone.prefix_len())
                .map_err(|_| AgentError::InvalidZonePrefix(prefix.to_string()))?
        }
        _ => IpNet::from(assigned.addr()),
    };

    let listen_port = if hub_router {
        WG_DEFAULT_PORT
    } else {
        local.listen_port
    };

    let address_changed = applied_address.is_some_and(|prev| *prev != address);
    if address_changed {
        info!(
            "Tunnel address changed from {:?} to {}",
            applied_address, address
        );
    }

    Ok(InterfaceConfig {
        address,
        listen_port,
        hub_router,
        address_changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{keyed, local_node};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_spoke_plan() {
        let store = RosterStore::new("self", "self-pk");
        let roster = store.update(vec![keyed("self", "10.0.0.5/32", "x")]);
        let mut local = local_node();
        local.listen_port = 40000;

        let cfg = plan(&roster, &local, &store, None).unwrap();
        assert_eq!(cfg.address, net("10.0.0.5/32"));
        assert_eq!(cfg.listen_port, 40000);
        assert!(!cfg.hub_router);
        assert!(!cfg.address_changed);
    }

    #[test]
    fn test_hub_router_plan() {
        let store = RosterStore::new("self", "self-pk");
        let mut me = keyed("self", "10.0.0.1/32", "x");
        me.hub_router = true;
        me.zone_prefix = "10.0.0.0/24".into();
        let roster = store.update(vec![me]);
        let mut local = local_node();
        local.listen_port = 40000;

        let cfg = plan(&roster, &local, &store, None).unwrap();
        assert_eq!(cfg.address, net("10.0.0.1/24"));
        assert_eq!(cfg.listen_port, WG_DEFAULT_PORT);
        assert!(cfg.hub_router);
    }

    #[test]
    fn test_address_change_detected() {
        let store = RosterStore::new("self", "self-pk");
        let roster = store.update(vec![keyed("self", "10.0.0.6", "x")]);

        let same = plan(&roster, &local_node(), &store, Some(&net("10.0.0.6/32"))).unwrap();
        assert!(!same.address_changed);

        let moved = plan(&roster, &local_node(), &store, Some(&net("10.0.0.5/32"))).unwrap();
        assert!(moved.address_changed);
        assert_eq!(moved.address, net("10.0.0.6/32"));
    }

    #[test]
    fn test_missing_self_record() {
        let store = RosterStore::new("self", "self-pk");
        let roster = store.update(vec![keyed("other", "10.0.0.9/32", "x")]);
        let err = plan(&roster, &local_node(), &store, None).unwrap_err();
        assert!(matches!(err, AgentError::NotInRoster(_)));
        assert!(err.is_cycle_skip());
    }
}
