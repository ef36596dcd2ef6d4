//! Wire messages exchanged with the coordinator.
//!
//! Rosters are JSON arrays of [`PeerRecord`]. The zone channel may also carry
//! an [`ErrorMessage`] instead of a roster; callers must use
//! [`decode_zone_payload`] rather than parsing a roster directly so a
//! rejection is never mistaken for an empty zone.

use serde::{Deserialize, Deserializer, Serialize};

/// Channel carrying roster updates for every zone.
pub const CONTROLLER_CHANNEL: &str = "controller";
/// Channel for nodes without a zone.
pub const DEFAULT_CHANNEL: &str = "default";
pub const HEALTHCHECK_REQUEST_CHANNEL: &str = "controller-healthcheck-request";
pub const HEALTHCHECK_REPLY_CHANNEL: &str = "controller-healthcheck-reply";
pub const HEALTHCHECK_REQUEST: &str = "controller-ready-request";
pub const HEALTHCHECK_REPLY: &str = "controller-healthy";
pub const REGISTER_NODE_REQUEST: &str = "register-node-request";

/// One roster entry as published by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PeerRecord {
    #[serde(alias = "device_id")]
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub zone_id: String,
    /// Reachable socket, `host:port`. Anything unparsable means "not ready".
    pub endpoint_ip: String,
    /// Comma separated prefixes or bare addresses.
    pub allowed_ips: String,
    pub node_address: String,
    #[serde(deserialize_with = "string_or_list")]
    pub child_prefix: Vec<String>,
    pub hub_router: bool,
    pub hub_zone: bool,
    pub zone_prefix: String,
    #[serde(rename = "reflexive-ip4", alias = "reflexive-address")]
    pub reflexive_address: String,
    #[serde(
        rename = "endpoint-local-address-ip4",
        alias = "endpoint_local_address_ip4",
        alias = "local-address"
    )]
    pub local_address: String,
    pub symmetric_nat: bool,
}

impl PeerRecord {
    /// Identity used for roster lookups: the device id, or the public key for
    /// coordinators that do not assign device ids.
    pub fn id(&self) -> &str {
        if self.device_id.is_empty() {
            self.public_key.as_deref().unwrap_or_default()
        } else {
            &self.device_id
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::One(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_string)
            .collect(),
        Raw::Many(v) => v,
        Raw::Null(()) => Vec::new(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Out-of-band coordinator notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(alias = "Event")]
    pub event: String,
    #[serde(alias = "Code", default)]
    pub code: String,
    #[serde(alias = "Msg", default)]
    pub msg: String,
}

impl ErrorMessage {
    pub fn is_error(&self) -> bool {
        self.event == "error"
    }
}

/// Registration request published by a joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub event: String,
    pub peer: PeerRecord,
}

impl RegisterMessage {
    pub fn new(peer: PeerRecord) -> Self {
        Self {
            event: REGISTER_NODE_REQUEST.to_string(),
            peer,
        }
    }
}

/// What arrived on a zone channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZonePayload {
    Roster(Vec<PeerRecord>),
    Notice(ErrorMessage),
}

/// Classify a zone-channel payload as a roster or a coordinator notice.
pub fn decode_zone_payload(payload: &str) -> Result<ZonePayload, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    if value.is_object() {
        let notice: ErrorMessage = serde_json::from_value(value)?;
        return Ok(ZonePayload::Notice(notice));
    }
    let roster: Vec<PeerRecord> = serde_json::from_value(value)?;
    Ok(ZonePayload::Roster(roster))
}
