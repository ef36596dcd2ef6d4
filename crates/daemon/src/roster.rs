//! Zone roster snapshots and the device-id → public-key cache.
//!
//! Snapshots are replaced wholesale: readers clone an `Arc` and never observe a
//! half-applied update. The key cache survives across snapshots for devices
//! that are still present and is pruned for devices that left.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{AgentError, AgentResult};
use crate::messages::PeerRecord;
use crate::registry::DeviceRegistry;

/// One immutable roster snapshot, keyed by device identity.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    pub generation: u64,
    entries: BTreeMap<String, PeerRecord>,
}

impl Roster {
    pub fn entries(&self) -> impl Iterator<Item = &PeerRecord> {
        self.entries.values()
    }

    pub fn get(&self, device_id: &str) -> Option<&PeerRecord> {
        self.entries.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct RosterStore {
    local_device_id: String,
    local_public_key: String,
    current: RwLock<Arc<Roster>>,
    keys: Mutex<HashMap<String, String>>,
}

impl RosterStore {
    pub fn new(local_device_id: impl Into<String>, local_public_key: impl Into<String>) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            local_public_key: local_public_key.into(),
            current: RwLock::new(Arc::new(Roster::default())),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the current snapshot. Keys carried inline seed the cache.
    pub fn update(&self, records: Vec<PeerRecord>) -> Arc<Roster> {
        let mut entries = BTreeMap::new();
        for record in records {
            let id = record.id().to_string();
            if id.is_empty() {
                warn!("Dropping roster entry without device id or public key");
                continue;
            }
            entries.insert(id, record);
        }

        {
            let mut keys = lock(&self.keys);
            keys.retain(|id, _| entries.contains_key(id));
            for (id, record) in &entries {
                if let Some(pk) = record.public_key.as_ref().filter(|pk| !pk.is_empty()) {
                    keys.insert(id.clone(), pk.clone());
                }
            }
        }

        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let roster = Arc::new(Roster {
            generation: current.generation + 1,
            entries,
        });
        *current = Arc::clone(&roster);
        debug!(
            "Roster generation {} with {} entries",
            roster.generation,
            roster.len()
        );
        roster
    }

    pub fn current(&self) -> Arc<Roster> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Whether `device_id` names this node.
    pub fn is_self(&self, device_id: &str) -> bool {
        device_id == self.local_device_id || device_id == self.local_public_key
    }

    /// Cached public key for a device, without touching the registry.
    pub fn cached_key(&self, device_id: &str) -> Option<String> {
        lock(&self.keys).get(device_id).cloned()
    }

    /// Public key for a device, asking the registry on a cache miss.
    pub async fn resolve(&self, device_id: &str, registry: &dyn DeviceRegistry) -> AgentResult<String> {
        if let Some(pk) = self.cached_key(device_id) {
            return Ok(pk);
        }
        let device = registry.get_device(device_id).await?;
        if device.public_key.is_empty() {
            return Err(AgentError::DeviceNotFound(device_id.to_string()));
        }
        lock(&self.keys).insert(device_id.to_string(), device.public_key.clone());
        Ok(device.public_key)
    }

    /// Fill the cache for every non-self entry of the current snapshot. Each
    /// lookup is time-boxed; failures are logged and left for the next pass.
    pub async fn warm_keys(&self, registry: &dyn DeviceRegistry, per_lookup: Duration) -> usize {
        let roster = self.current();
        let mut resolved = 0;
        for record in roster.entries() {
            let id = record.id();
            if self.is_self(id) || self.cached_key(id).is_some() {
                continue;
            }
            match timeout(per_lookup, self.resolve(id, registry)).await {
                Ok(Ok(_)) => resolved += 1,
                Ok(Err(e)) => warn!("Public key lookup for {} failed: {}", id, e),
                Err(_) => warn!("Public key lookup for {} timed out after {:?}", id, per_lookup),
            }
        }
        if resolved > 0 {
            info!("Resolved {} public keys from the device registry", resolved);
        }
        resolved
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, FakeRegistry};

    #[test]
    fn test_snapshot_replacement() {
        let store = RosterStore::new("self", "self-pk");
        let first = store.update(vec![record("a"), record("b")]);
        assert_eq!(first.generation, 1);
        assert_eq!(first.len(), 2);

        let second = store.update(vec![record("c")]);
        assert_eq!(second.generation, 2);
        assert!(store.current().get("a").is_none());
        assert!(store.current().get("c").is_some());
        // earlier readers keep their snapshot
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_inline_keys_seed_cache() {
        let store = RosterStore::new("self", "self-pk");
        let mut a = record("a");
        a.public_key = Some("pk-a".into());
        store.update(vec![a, record("b")]);

        assert_eq!(store.cached_key("a").as_deref(), Some("pk-a"));
        assert_eq!(store.cached_key("b"), None);

        store.update(vec![record("b")]);
        assert_eq!(store.cached_key("a"), None);
    }

    #[test]
    fn test_is_self() {
        let store = RosterStore::new("self", "self-pk");
        assert!(store.is_self("self"));
        assert!(store.is_self("self-pk"));
        assert!(!store.is_self("other"));
    }

    #[tokio::test]
    async fn test_resolve_uses_registry_once() {
        let store = RosterStore::new("self", "self-pk");
        let registry = FakeRegistry::new().with_key("a", "pk-a");
        store.update(vec![record("a")]);

        assert_eq!(store.resolve("a", &registry).await.unwrap(), "pk-a");
        assert_eq!(store.resolve("a", &registry).await.unwrap(), "pk-a");
        assert_eq!(registry.lookups(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_device() {
        let store = RosterStore::new("self", "self-pk");
        let registry = FakeRegistry::new();
        let err = store.resolve("ghost", &registry).await.unwrap_err();
        assert!(matches!(err, AgentError::DeviceNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_warm_keys_skips_self_and_failures() {
        let store = RosterStore::new("self", "self-pk");
        let registry = FakeRegistry::new().with_key("a", "pk-a");
        store.update(vec![record("self"), record("a"), record("ghost")]);

        let resolved = store.warm_keys(&registry, Duration::from_secs(1)).await;
        assert_eq!(resolved, 1);
        assert_eq!(store.cached_key("a").as_deref(), Some("pk-a"));
        assert_eq!(store.cached_key("ghost"), None);
        assert_eq!(registry.lookups(), 2);
    }
}
