use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::netcheck::SymmetricNatResult;
use crate::reconciler::ApplyReport;
use crate::topology::{PeeringMode, Resolution};

/// Prometheus-compatible counters for the convergence loop.
pub struct Metrics {
    // === Loop ===
    pub roster_snapshots_total: AtomicU64,
    pub reconcile_passes_total: AtomicU64,
    /// Passes abandoned before touching the device
    pub reconcile_skipped_total: AtomicU64,

    // === Device operations ===
    pub interface_recreations_total: AtomicU64,
    pub peer_ops_total: AtomicU64,
    pub peer_failures_total: AtomicU64,
    pub route_ops_total: AtomicU64,
    pub route_failures_total: AtomicU64,

    // === Current topology ===
    pub peers_local_direct: AtomicU64,
    pub peers_public_direct: AtomicU64,
    pub peers_relayed: AtomicU64,
    pub routes_applied: AtomicU64,

    // === NAT ===
    /// 0=unknown, 1=cone, 2=symmetric, 3=assumed symmetric
    pub nat_type: AtomicU8,
    pub nat_checks_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            roster_snapshots_total: AtomicU64::new(0),
            reconcile_passes_total: AtomicU64::new(0),
            reconcile_skipped_total: AtomicU64::new(0),
            interface_recreations_total: AtomicU64::new(0),
            peer_ops_total: AtomicU64::new(0),
            peer_failures_total: AtomicU64::new(0),
            route_ops_total: AtomicU64::new(0),
            route_failures_total: AtomicU64::new(0),
            peers_local_direct: AtomicU64::new(0),
            peers_public_direct: AtomicU64::new(0),
            peers_relayed: AtomicU64::new(0),
            routes_applied: AtomicU64::new(0),
            nat_type: AtomicU8::new(0),
            nat_checks_total: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    pub fn inc_snapshots(&self) {
        self.roster_snapshots_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.reconcile_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one completed pass into the counters.
    pub fn record_pass(&self, resolution: &Resolution, report: &ApplyReport, routes_applied: usize) {
        self.reconcile_passes_total.fetch_add(1, Ordering::Relaxed);
        if report.interface_recreated {
            self.interface_recreations_total.fetch_add(1, Ordering::Relaxed);
        }
        self.peer_ops_total
            .fetch_add((report.peers_added + report.peers_removed) as u64, Ordering::Relaxed);
        self.peer_failures_total
            .fetch_add(report.peers_failed as u64, Ordering::Relaxed);
        self.route_ops_total
            .fetch_add((report.routes_added + report.routes_removed) as u64, Ordering::Relaxed);
        self.route_failures_total
            .fetch_add(report.routes_failed as u64, Ordering::Relaxed);

        let count = |mode: PeeringMode| resolution.peers.iter().filter(|p| p.mode == mode).count() as u64;
        self.peers_local_direct
            .store(count(PeeringMode::LocalDirect), Ordering::Relaxed);
        self.peers_public_direct
            .store(count(PeeringMode::PublicDirect), Ordering::Relaxed);
        self.peers_relayed
            .store(count(PeeringMode::Relayed), Ordering::Relaxed);
        self.routes_applied
            .store(routes_applied as u64, Ordering::Relaxed);
    }

    pub fn set_nat(&self, nat: &SymmetricNatResult) {
        let value = match nat {
            SymmetricNatResult::NotSymmetric { .. } => 1,
            SymmetricNatResult::Symmetric { .. } => 2,
            SymmetricNatResult::AssumedSymmetric => 3,
        };
        self.nat_type.store(value, Ordering::Relaxed);
        self.nat_checks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nat_type_label(&self) -> &'static str {
        match self.nat_type.load(Ordering::Relaxed) {
            1 => "cone",
            2 => "symmetric",
            3 => "assumed_symmetric",
            _ => "unknown",
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, &str, &AtomicU64); 12] = [
            ("meshd_roster_snapshots_total", "counter", "Roster snapshots received", &self.roster_snapshots_total),
            ("meshd_reconcile_passes_total", "counter", "Completed reconciliation passes", &self.reconcile_passes_total),
            ("meshd_reconcile_skipped_total", "counter", "Snapshots skipped without touching the device", &self.reconcile_skipped_total),
            ("meshd_interface_recreations_total", "counter", "Tunnel interface (re)creations", &self.interface_recreations_total),
            ("meshd_peer_ops_total", "counter", "Peer add/remove operations", &self.peer_ops_total),
            ("meshd_peer_failures_total", "counter", "Failed peer operations", &self.peer_failures_total),
            ("meshd_route_ops_total", "counter", "Route add/delete operations", &self.route_ops_total),
            ("meshd_route_failures_total", "counter", "Failed route operations", &self.route_failures_total),
            ("meshd_peers_local_direct", "gauge", "Peers reached over the shared LAN", &self.peers_local_direct),
            ("meshd_peers_public_direct", "gauge", "Peers reached directly over the internet", &self.peers_public_direct),
            ("meshd_peers_relayed", "gauge", "Peer entries carrying hub-relayed traffic", &self.peers_relayed),
            ("meshd_routes_applied", "gauge", "Routes installed through the tunnel", &self.routes_applied),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP meshd_nat_type NAT classification (0=unknown,1=cone,2=symmetric,3=assumed_symmetric)\n\
             # TYPE meshd_nat_type gauge\n\
             meshd_nat_type{{type=\"{}\"}} {}\n\
             # HELP meshd_nat_checks_total NAT classifications performed\n\
             # TYPE meshd_nat_checks_total counter\n\
             meshd_nat_checks_total {}\n",
            self.nat_type_label(),
            self.nat_type.load(Ordering::Relaxed),
            self.nat_checks_total.load(Ordering::Relaxed),
        ));
        out
    }
}
