//! In-memory doubles for the host, registry and reflector capabilities.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{AgentError, AgentResult};
use crate::messages::PeerRecord;
use crate::netcheck::Reflector;
use crate::node::LocalNodeState;
use crate::platform::{CommandRunner, Os, PlatformDriver, PlatformError, RouteTable, TunnelDevice};
use crate::registry::{Device, DeviceRegistry};

/// Roster entry with only an id.
pub fn record(id: &str) -> PeerRecord {
    PeerRecord {
        device_id: id.to_string(),
        ..Default::default()
    }
}

/// Roster entry with an inline key `pk-<id>`, address and endpoint.
pub fn keyed(id: &str, allowed: &str, endpoint: &str) -> PeerRecord {
    PeerRecord {
        device_id: id.to_string(),
        public_key: Some(format!("pk-{}", id)),
        zone_id: "zone-1".to_string(),
        endpoint_ip: endpoint.to_string(),
        allowed_ips: allowed.to_string(),
        ..Default::default()
    }
}

pub fn local_node() -> LocalNodeState {
    LocalNodeState {
        device_id: "self".to_string(),
        public_key: "self-pk".to_string(),
        zone: "zone-1".to_string(),
        os: Os::Linux,
        hub_router: false,
        listen_port: 51820,
        requested_address: None,
        endpoint_ip: "198.51.100.100".parse().unwrap(),
        local_address: Some("192.168.1.10".parse().unwrap()),
        reflexive_address: None,
        child_prefixes: Vec::new(),
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    keys: HashMap<String, String>,
    lookups: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, id: &str, pk: &str) -> Self {
        self.keys.insert(id.to_string(), pk.to_string());
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn get_device(&self, device_id: &str) -> AgentResult<Device> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.keys
            .get(device_id)
            .map(|pk| Device {
                id: device_id.to_string(),
                public_key: pk.clone(),
                hostname: String::new(),
                os: "linux".to_string(),
            })
            .ok_or_else(|| AgentError::DeviceNotFound(device_id.to_string()))
    }
}

/// Answers per reflector name; unknown names are unreachable.
#[derive(Default)]
pub struct ScriptedReflector {
    answers: HashMap<String, SocketAddr>,
    calls: Mutex<Vec<(String, u16)>>,
}

impl ScriptedReflector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, reflector: &str, mapped: AgentResult<SocketAddr>) -> Self {
        if let Ok(addr) = mapped {
            self.answers.insert(reflector.to_string(), addr);
        }
        self
    }

    pub fn calls(&self) -> Vec<(String, u16)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reflector for ScriptedReflector {
    async fn reflect(&self, reflector: &str, source_port: u16) -> AgentResult<SocketAddr> {
        self.calls
            .lock()
            .unwrap()
            .push((reflector.to_string(), source_port));
        self.answers
            .get(reflector)
            .copied()
            .ok_or_else(|| AgentError::ReflectionUnavailable {
                reflector: reflector.to_string(),
                reason: "unreachable".to_string(),
            })
    }
}

/// Records command lines; `fail_on` matches whole lines, `respond` prefixes.
#[derive(Default)]
pub struct RecordingRunner {
    failures: Vec<String>,
    responses: Vec<(String, String)>,
    log: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, line: &str) -> Self {
        self.failures.push(line.to_string());
        self
    }

    pub fn respond(mut self, prefix: &str, output: &str) -> Self {
        self.responses.push((prefix.to_string(), output.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn stdin_for(&self, prefix: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.starts_with(prefix))
            .and_then(|(_, stdin)| stdin.clone())
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<String, PlatformError> {
        let line = format!("{} {}", program, args.join(" "));
        self.log
            .lock()
            .unwrap()
            .push((line.clone(), stdin.map(str::to_string)));

        if self.failures.contains(&line) {
            return Err(PlatformError::CommandFailed {
                command: line,
                status: "exit status: 1".to_string(),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(self
            .responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

/// Device mutation seen by [`FakeDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateInterface(IpNet, u16),
    AddPeer(String),
    RemovePeer(String),
    AddRoute(IpNet),
    DeleteRoute(IpNet),
}

#[derive(Default)]
struct FakeState {
    ops: Vec<Op>,
    interface_up: bool,
    routes: BTreeSet<IpNet>,
    failing_peers: BTreeSet<String>,
    failing_removals: BTreeSet<String>,
    fail_interface: bool,
}

/// Host double; clones share state so tests can inspect what the reconciler did.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn fail_peer(&self, pk: &str) {
        self.state.lock().unwrap().failing_peers.insert(pk.to_string());
    }

    pub fn fail_remove(&self, pk: &str) {
        self.state.lock().unwrap().failing_removals.insert(pk.to_string());
    }

    pub fn fail_interface(&self) {
        self.state.lock().unwrap().fail_interface = true;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_peers.clear();
        state.failing_removals.clear();
        state.fail_interface = false;
    }

    pub fn preinstall_route(&self, prefix: IpNet) {
        self.state.lock().unwrap().routes.insert(prefix);
    }

    pub fn has_route(&self, prefix: &IpNet) -> bool {
        self.state.lock().unwrap().routes.contains(prefix)
    }

    pub fn drop_interface(&self) {
        let mut state = self.state.lock().unwrap();
        state.interface_up = false;
        state.routes.clear();
    }

    fn scripted_failure(what: &str) -> PlatformError {
        PlatformError::CommandFailed {
            command: what.to_string(),
            status: "exit status: 1".to_string(),
            stderr: "scripted failure".to_string(),
        }
    }
}

impl TunnelDevice for FakeDriver {
    fn interface_name(&self) -> &str {
        "wg-test"
    }

    fn interface_exists(&self) -> Result<bool, PlatformError> {
        Ok(self.state.lock().unwrap().interface_up)
    }

    fn create_or_replace_interface(
        &self,
        address: &IpNet,
        listen_port: u16,
        _private_key: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_interface {
            return Err(Self::scripted_failure("create interface"));
        }
        state.ops.push(Op::CreateInterface(*address, listen_port));
        state.interface_up = true;
        state.routes.clear();
        Ok(())
    }

    fn add_or_replace_peer(
        &self,
        public_key: &str,
        _endpoint: Option<SocketAddr>,
        _allowed_ips: &[IpNet],
        _persistent_keepalive: Option<u16>,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_peers.contains(public_key) {
            return Err(Self::scripted_failure("add peer"));
        }
        state.ops.push(Op::AddPeer(public_key.to_string()));
        Ok(())
    }

    fn remove_peer(&self, public_key: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_removals.contains(public_key) {
            return Err(Self::scripted_failure("remove peer"));
        }
        state.ops.push(Op::RemovePeer(public_key.to_string()));
        Ok(())
    }
}

impl RouteTable for FakeDriver {
    fn route_exists(&self, prefix: &IpNet) -> Result<bool, PlatformError> {
        Ok(self.state.lock().unwrap().routes.contains(prefix))
    }

    fn add_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::AddRoute(*prefix));
        state.routes.insert(*prefix);
        Ok(())
    }

    fn delete_route(&self, prefix: &IpNet) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::DeleteRoute(*prefix));
        state.routes.remove(prefix);
        Ok(())
    }
}

impl PlatformDriver for FakeDriver {
    fn os(&self) -> Os {
        Os::Linux
    }

    fn check_prerequisites(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn enable_forwarding(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}
