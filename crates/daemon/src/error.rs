//! Error types for the mesh agent.

use std::time::Duration;
use thiserror::Error;

use crate::platform::PlatformError;

/// Errors raised while converging the local node onto the zone roster.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A reflector could not be reached or returned garbage.
    #[error("reflection via {reflector} failed: {reason}")]
    ReflectionUnavailable { reflector: String, reason: String },

    /// The registry has no device with this id.
    #[error("device {0} not found in registry")]
    DeviceNotFound(String),

    /// The zone is hub-and-spoke but its router has not joined yet.
    #[error("hub zone has no hub router joined yet")]
    NoHubRouterJoined,

    #[error("invalid zone prefix '{0}'")]
    InvalidZonePrefix(String),

    /// The local node's own record is missing from the snapshot.
    #[error("local node {0} is not in the roster")]
    NotInRoster(String),

    /// The coordinator rejected this node's zone membership.
    #[error("coordinator rejected zone membership [{code}]: {msg}")]
    ZoneRejected { code: String, msg: String },

    #[error("coordinator not ready within {0:?}")]
    CoordinatorUnavailable(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn invalid_address(value: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::InvalidAddress {
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that abandon the current snapshot but leave applied state alone.
    pub fn is_cycle_skip(&self) -> bool {
        matches!(
            self,
            AgentError::NoHubRouterJoined
                | AgentError::InvalidZonePrefix(_)
                | AgentError::NotInRoster(_)
                | AgentError::Platform(_)
        )
    }

    /// Errors that must terminate the agent.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ZoneRejected { .. }
                | AgentError::CoordinatorUnavailable(_)
                | AgentError::Unsupported(_)
        )
    }
}
