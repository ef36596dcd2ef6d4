//! The convergence loop.
//!
//! A single task owns the roster, the NAT classification and the reconciler.
//! Inbound bus messages are handled strictly in arrival order and each snapshot
//! is fully applied or explicitly skipped before the next one is read. The
//! shutdown signal is only observed between passes, so a device is never left
//! half-programmed.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::bus::BusMessage;
use crate::error::{AgentError, AgentResult};
use crate::messages::{decode_zone_payload, PeerRecord, ZonePayload, CONTROLLER_CHANNEL, DEFAULT_CHANNEL};
use crate::metrics::Metrics;
use crate::netcheck::SymmetricNatResult;
use crate::node::LocalNodeState;
use crate::planner::plan;
use crate::reconciler::Reconciler;
use crate::registry::DeviceRegistry;
use crate::roster::{Roster, RosterStore};
use crate::topology::TopologyResolver;

const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_KEEPALIVE: u16 = 25;

pub struct Agent {
    local: LocalNodeState,
    store: RosterStore,
    registry: Arc<dyn DeviceRegistry>,
    resolver: TopologyResolver,
    reconciler: Reconciler,
    metrics: Arc<Metrics>,
    nat: SymmetricNatResult,
    registry_timeout: Duration,
    resync_interval: Duration,
}

impl Agent {
    pub fn new(
        local: LocalNodeState,
        reconciler: Reconciler,
        registry: Arc<dyn DeviceRegistry>,
        nat: SymmetricNatResult,
        metrics: Arc<Metrics>,
    ) -> Self {
        let store = RosterStore::new(local.device_id.clone(), local.public_key.clone());
        metrics.set_nat(&nat);
        Self {
            local,
            store,
            registry,
            resolver: TopologyResolver::new(Some(DEFAULT_KEEPALIVE)),
            reconciler,
            metrics,
            nat,
            registry_timeout: DEFAULT_REGISTRY_TIMEOUT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Persistent keepalive handed to spoke peers; `None` disables it.
    pub fn with_keepalive(mut self, keepalive: Option<u16>) -> Self {
        self.resolver = TopologyResolver::new(keepalive);
        self
    }

    pub fn with_registry_timeout(mut self, per_lookup: Duration) -> Self {
        self.registry_timeout = per_lookup;
        self
    }

    pub fn with_resync_interval(mut self, every: Duration) -> Self {
        self.resync_interval = every.max(Duration::from_secs(1));
        self
    }

    pub fn local(&self) -> &LocalNodeState {
        &self.local
    }

    pub fn nat(&self) -> &SymmetricNatResult {
        &self.nat
    }

    pub fn roster(&self) -> Arc<Roster> {
        self.store.current()
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<BusMessage>,
        mut nat_updates: mpsc::Receiver<SymmetricNatResult>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AgentResult<()> {
        let mut resync = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Agent loop started for {} in zone {} ({})",
            self.local.device_id, self.local.zone, self.nat
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("Shutdown requested, leaving applied state in place");
                    return Ok(());
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await?,
                    None => return Err(AgentError::Transport("message bus closed".to_string())),
                },
                Some(nat) = nat_updates.recv() => self.update_nat(nat).await?,
                _ = resync.tick() => self.resync().await?,
            }
        }
    }

    /// Handle one inbound bus message. Only fatal errors are returned.
    pub async fn handle_message(&mut self, msg: BusMessage) -> AgentResult<()> {
        let records = if msg.channel == self.local.zone {
            match decode_zone_payload(&msg.payload) {
                Ok(ZonePayload::Roster(records)) => records,
                Ok(ZonePayload::Notice(notice)) if notice.is_error() => {
                    error!(
                        "Zone {} rejected by coordinator [{}]: {}",
                        self.local.zone, notice.code, notice.msg
                    );
                    return Err(AgentError::ZoneRejected {
                        code: notice.code,
                        msg: notice.msg,
                    });
                }
                Ok(ZonePayload::Notice(notice)) => {
                    warn!(
                        "Coordinator notice on {}: {} [{}] {}",
                        msg.channel, notice.event, notice.code, notice.msg
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Unsupported message on zone channel {}: {}", msg.channel, e);
                    return Ok(());
                }
            }
        } else if msg.channel == CONTROLLER_CHANNEL || msg.channel == DEFAULT_CHANNEL {
            let records: Vec<PeerRecord> = match serde_json::from_str(&msg.payload) {
                Ok(records) => records,
                Err(_) => {
                    debug!("Ignoring non-roster payload on {}", msg.channel);
                    return Ok(());
                }
            };
            // controller broadcasts carry every zone's roster
            if msg.channel == CONTROLLER_CHANNEL
                && records.first().map_or(true, |r| r.zone_id != self.local.zone)
            {
                return Ok(());
            }
            records
        } else {
            debug!("Ignoring message on unexpected channel {}", msg.channel);
            return Ok(());
        };

        self.apply_snapshot(records).await
    }

    async fn apply_snapshot(&mut self, mut records: Vec<PeerRecord>) -> AgentResult<()> {
        let before = records.len();
        records.retain(|r| r.zone_id.is_empty() || r.zone_id == self.local.zone);
        if records.len() != before {
            debug!("Dropped {} roster entries from other zones", before - records.len());
        }

        self.metrics.inc_snapshots();
        let roster = self.store.update(records);
        info!(
            "Roster generation {} received ({} entries)",
            roster.generation,
            roster.len()
        );
        self.reconcile().await
    }

    /// Re-run a pass when the NAT classification changes.
    pub async fn update_nat(&mut self, nat: SymmetricNatResult) -> AgentResult<()> {
        self.metrics.set_nat(&nat);
        if nat == self.nat {
            debug!("NAT classification unchanged ({})", nat);
            return Ok(());
        }
        info!("NAT classification changed: {} -> {}", self.nat, nat);
        self.nat = nat;
        if self.store.current().generation == 0 {
            return Ok(());
        }
        self.reconcile().await
    }

    async fn resync(&mut self) -> AgentResult<()> {
        if self.store.current().generation == 0 {
            debug!("Resync skipped, no roster yet");
            return Ok(());
        }
        debug!("Periodic resync");
        self.reconcile().await
    }

    async fn reconcile(&mut self) -> AgentResult<()> {
        self.store
            .warm_keys(self.registry.as_ref(), self.registry_timeout)
            .await;

        let roster = self.store.current();
        match self.reconcile_pass(&roster) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if e.is_cycle_skip() {
                    warn!(
                        "Skipping roster generation {}, keeping applied state: {}",
                        roster.generation, e
                    );
                } else {
                    error!("Reconciliation of generation {} failed: {}", roster.generation, e);
                }
                self.metrics.inc_skipped();
                Ok(())
            }
        }
    }

    fn reconcile_pass(&mut self, roster: &Roster) -> AgentResult<()> {
        let applied_address = self
            .reconciler
            .applied()
            .interface
            .as_ref()
            .map(|iface| iface.address);
        let interface = plan(roster, &self.local, &self.store, applied_address.as_ref())?;
        let resolution = self
            .resolver
            .resolve(roster, &self.local, &self.nat, &self.store)?;

        let report = self
            .reconciler
            .apply(&interface, &resolution.peers, &resolution.routes)?;
        self.metrics
            .record_pass(&resolution, &report, self.reconciler.applied().routes.len());
        Ok(())
    }
}
