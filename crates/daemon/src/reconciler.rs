//! Drives the tunnel device and route table from applied state to desired
//! state with the fewest operations.
//!
//! Phases run in order: interface, peers, routes. A failed peer or route
//! operation is logged and skipped; the rest of the pass continues and the
//! failed item is retried on the next pass because applied state only records
//! what actually succeeded.
//!
//! Routes found on the host before this process wanted them are adopted but
//! never deleted.

use ipnet::IpNet;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::AgentResult;
use crate::planner::InterfaceConfig;
use crate::platform::PlatformDriver;
use crate::topology::DesiredPeerConfig;

/// What the device currently holds, as far as this process knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedState {
    pub interface: Option<InterfaceConfig>,
    /// Keyed by public key.
    pub peers: BTreeMap<String, DesiredPeerConfig>,
    /// Routes this process added.
    pub routes: BTreeSet<IpNet>,
    /// Wanted routes that were already on the host.
    pub adopted_routes: BTreeSet<IpNet>,
}

/// Operation counts for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub interface_recreated: bool,
    pub peers_added: usize,
    pub peers_removed: usize,
    pub peers_failed: usize,
    pub routes_added: usize,
    pub routes_removed: usize,
    pub routes_failed: usize,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        *self == ApplyReport::default()
    }
}

pub struct Reconciler {
    driver: Box<dyn PlatformDriver>,
    private_key: String,
    applied: AppliedState,
}

impl Reconciler {
    pub fn new(driver: Box<dyn PlatformDriver>, private_key: impl Into<String>) -> Self {
        Self {
            driver,
            private_key: private_key.into(),
            applied: AppliedState::default(),
        }
    }

    pub fn applied(&self) -> &AppliedState {
        &self.applied
    }

    /// Converge onto `desired`. Only an interface failure aborts the pass.
    pub fn apply(
        &mut self,
        interface: &InterfaceConfig,
        desired: &[DesiredPeerConfig],
        desired_routes: &[IpNet],
    ) -> AgentResult<ApplyReport> {
        let mut report = ApplyReport::default();
        self.apply_interface(interface, &mut report)?;
        self.apply_peers(desired, &mut report);
        self.apply_routes(desired_routes, &mut report);

        if report.is_noop() {
            debug!("Device already converged");
        } else {
            info!(
                "Reconciled: peers +{} -{} ({} failed), routes +{} -{} ({} failed)",
                report.peers_added,
                report.peers_removed,
                report.peers_failed,
                report.routes_added,
                report.routes_removed,
                report.routes_failed
            );
        }
        Ok(report)
    }

    fn apply_interface(&mut self, interface: &InterfaceConfig, report: &mut ApplyReport) -> AgentResult<()> {
        let recreate = match &self.applied.interface {
            _ if interface.address_changed => true,
            None => true,
            Some(current) => {
                current.address != interface.address
                    || current.listen_port != interface.listen_port
                    || !self.driver.interface_exists()?
            }
        };
        if !recreate {
            return Ok(());
        }

        // peers and routes do not survive the old interface
        self.applied = AppliedState::default();
        if let Err(e) = self.driver.create_or_replace_interface(
            &interface.address,
            interface.listen_port,
            &self.private_key,
        ) {
            error!(
                "Failed to create interface {}: {}",
                self.driver.interface_name(),
                e
            );
            return Err(e.into());
        }
        self.applied.interface = Some(InterfaceConfig {
            address_changed: false,
            ..interface.clone()
        });
        report.interface_recreated = true;
        Ok(())
    }

    fn apply_peers(&mut self, desired: &[DesiredPeerConfig], report: &mut ApplyReport) {
        let wanted: BTreeMap<&str, &DesiredPeerConfig> =
            desired.iter().map(|p| (p.public_key.as_str(), p)).collect();

        let stale: Vec<String> = self
            .applied
            .peers
            .keys()
            .filter(|pk| !wanted.contains_key(pk.as_str()))
            .cloned()
            .collect();
        for pk in stale {
            match self.driver.remove_peer(&pk) {
                Ok(()) => {
                    info!("Removed peer {}", pk);
                    self.applied.peers.remove(&pk);
                    report.peers_removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove peer {}: {}", pk, e);
                    report.peers_failed += 1;
                }
            }
        }

        for peer in wanted.values() {
            let pk = peer.public_key.as_str();
            if let Some(current) = self.applied.peers.get(pk) {
                if !current.differs_from(peer) {
                    continue;
                }
                // drop the old entry so stale allowed ranges do not linger
                if let Err(e) = self.driver.remove_peer(pk) {
                    warn!("Failed to remove peer {} before update: {}", pk, e);
                    report.peers_failed += 1;
                    continue;
                }
                self.applied.peers.remove(pk);
            }

            match self.driver.add_or_replace_peer(
                pk,
                peer.endpoint,
                &peer.allowed_ips,
                peer.persistent_keepalive,
            ) {
                Ok(()) => {
                    info!(
                        "Configured peer {} ({}) {} via {:?}",
                        peer.device_id, pk, peer.mode, peer.endpoint
                    );
                    self.applied.peers.insert(pk.to_string(), (*peer).clone());
                    report.peers_added += 1;
                }
                Err(e) => {
                    warn!("Failed to configure peer {} ({}): {}", peer.device_id, pk, e);
                    report.peers_failed += 1;
                }
            }
        }
    }

    fn apply_routes(&mut self, extra: &[IpNet], report: &mut ApplyReport) {
        // a peer whose removal failed is still on the device and keeps its routes
        let mut wanted: BTreeSet<IpNet> = extra.iter().copied().collect();
        for peer in self.applied.peers.values() {
            wanted.extend(peer.allowed_ips.iter().copied());
        }
        self.applied.adopted_routes.retain(|prefix| wanted.contains(prefix));

        let stale: Vec<IpNet> = self.applied.routes.difference(&wanted).copied().collect();
        for prefix in stale {
            match self.driver.delete_route(&prefix) {
                Ok(()) => {
                    debug!("Deleted route {}", prefix);
                    self.applied.routes.remove(&prefix);
                    report.routes_removed += 1;
                }
                Err(e) => {
                    warn!("Failed to delete route {}: {}", prefix, e);
                    report.routes_failed += 1;
                }
            }
        }

        let missing: Vec<IpNet> = wanted
            .iter()
            .filter(|&p| !self.applied.routes.contains(p) && !self.applied.adopted_routes.contains(p))
            .copied()
            .collect();
        for prefix in missing {
            match self.driver.route_exists(&prefix) {
                Ok(true) => {
                    debug!("Route {} already present, leaving it in place", prefix);
                    self.applied.adopted_routes.insert(prefix);
                    continue;
                }
                Ok(false) => {}
                Err(e) => debug!("Route lookup for {} failed: {}", prefix, e),
            }
            match self.driver.add_route(&prefix) {
                Ok(()) => {
                    debug!("Added route {} via {}", prefix, self.driver.interface_name());
                    self.applied.routes.insert(prefix);
                    report.routes_added += 1;
                }
                Err(e) => {
                    warn!("Failed to add route {}: {}", prefix, e);
                    report.routes_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, Op};
    use crate::topology::PeeringMode;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn iface(addr: &str) -> InterfaceConfig {
        InterfaceConfig {
            address: net(addr),
            listen_port: 51820,
            hub_router: false,
            address_changed: false,
        }
    }

    fn peer(pk: &str, allowed: &[&str]) -> DesiredPeerConfig {
        DesiredPeerConfig {
            device_id: format!("dev-{}", pk),
            public_key: pk.to_string(),
            endpoint: Some("198.51.100.2:51820".parse().unwrap()),
            allowed_ips: allowed.iter().map(|s| net(s)).collect(),
            persistent_keepalive: Some(25),
            mode: PeeringMode::PublicDirect,
        }
    }

    fn reconciler() -> (Reconciler, FakeDriver) {
        let driver = FakeDriver::new();
        (Reconciler::new(Box::new(driver.clone()), "priv="), driver)
    }

    #[test]
    fn test_first_pass_builds_everything() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"]), peer("b", &["10.0.0.3/32", "192.168.5.0/24"])];

        let report = rec.apply(&iface("10.0.0.1/32"), &peers, &[net("192.168.5.0/24")]).unwrap();
        assert!(report.interface_recreated);
        assert_eq!(report.peers_added, 2);
        assert_eq!(report.routes_added, 3);
        assert_eq!(driver.ops()[0], Op::CreateInterface(net("10.0.0.1/32"), 51820));
        assert_eq!(rec.applied().peers.len(), 2);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"]), peer("b", &["10.0.0.3/32"])];
        rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        let after_first = driver.ops().len();

        let report = rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        assert!(report.is_noop());
        assert_eq!(driver.ops().len(), after_first);
    }

    #[test]
    fn test_address_change_recreates_before_peers() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"])];
        rec.apply(&iface("10.0.0.5/32"), &peers, &[]).unwrap();
        driver.clear();

        let mut moved = iface("10.0.0.6/32");
        moved.address_changed = true;
        let report = rec.apply(&moved, &peers, &[]).unwrap();

        assert!(report.interface_recreated);
        let ops = driver.ops();
        assert_eq!(ops[0], Op::CreateInterface(net("10.0.0.6/32"), 51820));
        assert_eq!(ops[1], Op::AddPeer("a".into()));
        assert_eq!(report.peers_added, 1);
    }

    #[test]
    fn test_changed_peer_is_removed_then_added() {
        let (mut rec, driver) = reconciler();
        rec.apply(&iface("10.0.0.1/32"), &[peer("a", &["10.0.0.2/32"])], &[]).unwrap();
        driver.clear();

        let updated = peer("a", &["10.0.0.2/32", "172.16.0.0/16"]);
        rec.apply(&iface("10.0.0.1/32"), &[updated], &[]).unwrap();
        assert_eq!(
            driver.ops(),
            vec![
                Op::RemovePeer("a".into()),
                Op::AddPeer("a".into()),
                Op::AddRoute(net("172.16.0.0/16")),
            ]
        );
    }

    #[test]
    fn test_departed_peer_and_routes_are_removed() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"]), peer("b", &["10.0.0.3/32"])];
        rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        driver.clear();

        let report = rec.apply(&iface("10.0.0.1/32"), &peers[..1], &[]).unwrap();
        assert_eq!(report.peers_removed, 1);
        assert_eq!(report.routes_removed, 1);
        assert_eq!(
            driver.ops(),
            vec![Op::RemovePeer("b".into()), Op::DeleteRoute(net("10.0.0.3/32"))]
        );
    }

    #[test]
    fn test_peer_failure_does_not_abort_pass() {
        let (mut rec, driver) = reconciler();
        driver.fail_peer("a");
        let peers = vec![peer("a", &["10.0.0.2/32"]), peer("b", &["10.0.0.3/32"])];

        let report = rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        assert_eq!(report.peers_failed, 1);
        assert_eq!(report.peers_added, 1);
        assert!(!rec.applied().peers.contains_key("a"));
        // no route for the peer that never made it onto the device
        assert!(!rec.applied().routes.contains(&net("10.0.0.2/32")));
        assert!(rec.applied().routes.contains(&net("10.0.0.3/32")));

        // retried on the next pass
        driver.heal();
        let report = rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        assert_eq!(report.peers_added, 1);
        assert_eq!(report.routes_added, 1);
    }

    #[test]
    fn test_existing_route_is_not_re_added() {
        let (mut rec, driver) = reconciler();
        rec.apply(&iface("10.0.0.1/32"), &[], &[]).unwrap();
        driver.preinstall_route(net("10.0.0.2/32"));
        rec.apply(&iface("10.0.0.1/32"), &[peer("a", &["10.0.0.2/32"])], &[]).unwrap();

        assert!(!driver.ops().contains(&Op::AddRoute(net("10.0.0.2/32"))));
        assert!(rec.applied().adopted_routes.contains(&net("10.0.0.2/32")));
        assert!(!rec.applied().routes.contains(&net("10.0.0.2/32")));
    }

    #[test]
    fn test_preexisting_route_survives_peer_departure() {
        let (mut rec, driver) = reconciler();
        rec.apply(&iface("10.0.0.1/32"), &[], &[]).unwrap();
        driver.preinstall_route(net("192.168.5.0/24"));
        let peers = vec![peer("a", &["10.0.0.2/32", "192.168.5.0/24"])];
        rec.apply(&iface("10.0.0.1/32"), &peers, &[net("192.168.5.0/24")]).unwrap();
        driver.clear();

        let report = rec.apply(&iface("10.0.0.1/32"), &[], &[]).unwrap();
        assert_eq!(report.routes_removed, 1);
        assert_eq!(
            driver.ops(),
            vec![Op::RemovePeer("a".into()), Op::DeleteRoute(net("10.0.0.2/32"))]
        );
        assert!(driver.has_route(&net("192.168.5.0/24")));
        assert!(rec.applied().adopted_routes.is_empty());
    }

    #[test]
    fn test_failed_stale_removal_keeps_routes() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"]), peer("b", &["10.0.0.3/32", "172.16.0.0/16"])];
        rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        driver.clear();
        driver.fail_remove("b");

        let report = rec.apply(&iface("10.0.0.1/32"), &peers[..1], &[]).unwrap();
        assert_eq!(report.peers_failed, 1);
        assert_eq!(report.routes_removed, 0);
        assert!(driver.ops().is_empty());
        assert!(rec.applied().peers.contains_key("b"));
        assert!(rec.applied().routes.contains(&net("172.16.0.0/16")));

        // removal goes through once the device cooperates, routes follow
        driver.heal();
        let report = rec.apply(&iface("10.0.0.1/32"), &peers[..1], &[]).unwrap();
        assert_eq!(report.peers_removed, 1);
        assert_eq!(report.routes_removed, 2);
    }

    #[test]
    fn test_failed_removal_before_update_keeps_old_routes() {
        let (mut rec, driver) = reconciler();
        rec.apply(&iface("10.0.0.1/32"), &[peer("a", &["10.0.0.2/32", "172.16.0.0/16"])], &[])
            .unwrap();
        driver.clear();
        driver.fail_remove("a");

        let updated = peer("a", &["10.0.0.2/32"]);
        let report = rec.apply(&iface("10.0.0.1/32"), &[updated], &[]).unwrap();
        assert_eq!(report.peers_failed, 1);
        assert_eq!(report.routes_removed, 0);
        assert!(driver.ops().is_empty());
        assert!(rec.applied().routes.contains(&net("172.16.0.0/16")));
        assert_eq!(
            rec.applied().peers["a"].allowed_ips,
            vec![net("10.0.0.2/32"), net("172.16.0.0/16")]
        );
    }

    #[test]
    fn test_interface_failure_aborts() {
        let (mut rec, driver) = reconciler();
        driver.fail_interface();
        let err = rec
            .apply(&iface("10.0.0.1/32"), &[peer("a", &["10.0.0.2/32"])], &[])
            .unwrap_err();
        assert!(err.is_cycle_skip());
        assert!(rec.applied().interface.is_none());
        assert!(!driver.ops().iter().any(|op| matches!(op, Op::AddPeer(_))));
    }

    #[test]
    fn test_externally_deleted_interface_is_rebuilt() {
        let (mut rec, driver) = reconciler();
        let peers = vec![peer("a", &["10.0.0.2/32"])];
        rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();

        driver.drop_interface();
        let report = rec.apply(&iface("10.0.0.1/32"), &peers, &[]).unwrap();
        assert!(report.interface_recreated);
        assert_eq!(report.peers_added, 1);
    }
}
