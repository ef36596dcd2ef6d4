//! # meshd
//!
//! Node agent for a coordinator-driven WireGuard mesh. The agent receives zone
//! rosters from the coordinator and keeps the local tunnel device and routing
//! table converged onto them, choosing the cheapest viable path to each peer.
//!
//! ## Key Components
//!
//! ### Reachability
//! - [`NatClassifier`] - Symmetric NAT detection via two STUN reflectors
//!
//! ### Convergence
//! - [`RosterStore`] - Latest zone roster and the device key cache
//! - [`TopologyResolver`] - Desired peer set from the roster
//! - [`plan`] - Local interface address and listen port
//! - [`Reconciler`] - Diff-and-apply onto the tunnel device and route table
//! - [`Agent`] - The single-writer loop tying it together
//!
//! ### Host
//! - [`PlatformDriver`] - Tunnel device and route table per OS
//! - [`MessageBus`] / [`DeviceRegistry`] - Coordinator collaborators
//!
//! ## Example
//!
//! ```rust,ignore
//! use meshd::{NatClassifier, StunReflector};
//!
//! let classifier = NatClassifier::new(StunReflector::default());
//! let nat = classifier.classify_or_assume_symmetric(51820).await;
//! println!("NAT: {}", nat);
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod netcheck;
pub mod node;
pub mod planner;
pub mod platform;
pub mod reconciler;
pub mod registry;
pub mod roster;
pub mod stun;
pub mod topology;
pub mod wg;

#[cfg(test)]
mod testing;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, CoordinatorConfig, DaemonConfig, NetworkConfig, TimingConfig};

// ============================================================================
// Errors
// ============================================================================

pub use error::{AgentError, AgentResult};

// ============================================================================
// Coordinator
// ============================================================================

pub use bus::{BusMessage, MessageBus, TcpBus};
pub use messages::{ErrorMessage, PeerRecord, RegisterMessage, ZonePayload};
pub use registry::{Device, DeviceRegistry, HttpDeviceRegistry};

// ============================================================================
// NAT Detection
// ============================================================================

pub use netcheck::{NatClassifier, Reflector, StunReflector, SymmetricNatResult};

// ============================================================================
// Convergence
// ============================================================================

pub use agent::Agent;
pub use node::LocalNodeState;
pub use planner::{plan, InterfaceConfig};
pub use reconciler::{AppliedState, ApplyReport, Reconciler};
pub use roster::{Roster, RosterStore};
pub use topology::{DesiredPeerConfig, PeeringMode, Resolution, TopologyResolver};

// ============================================================================
// Platform
// ============================================================================

pub use platform::{native_driver, Os, PlatformDriver, PlatformError};

// ============================================================================
// Identity
// ============================================================================

pub use identity::Identity;
