//! Symmetric NAT classification.
//!
//! The node asks two independent reflectors for its public mapping, sending
//! both queries from the same local port. A NAT that hands out a different
//! (address, port) per destination is symmetric: peers cannot reach it by
//! learning its public mapping from a third party, so it must be reached
//! through a hub router instead of directly.
//!
//! ### Failure handling
//! A failed reflection is retried with exponential backoff. If the reflectors
//! stay unreachable the node is assumed to be symmetric, which only ever
//! removes direct paths and never invents one.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use crate::error::{AgentError, AgentResult};
use crate::stun::{build_binding_request, parse_binding_response, DEFAULT_REFLECTORS};

/// Reachability capability: "what public address does reflector X see for
/// traffic from local port P?"
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, reflector: &str, source_port: u16) -> AgentResult<SocketAddr>;
}

/// Outcome of one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymmetricNatResult {
    /// Both reflectors saw the same mapping.
    NotSymmetric { mapped: SocketAddr },
    /// The mapping depends on the destination.
    Symmetric { first: SocketAddr, second: SocketAddr },
    /// Reflection failed; treated as symmetric.
    AssumedSymmetric,
}

impl SymmetricNatResult {
    pub fn is_symmetric(&self) -> bool {
        !matches!(self, SymmetricNatResult::NotSymmetric { .. })
    }

    /// Public address as seen by the first reflector, if any answered.
    pub fn reflexive_ip(&self) -> Option<IpAddr> {
        match self {
            SymmetricNatResult::NotSymmetric { mapped } => Some(mapped.ip()),
            SymmetricNatResult::Symmetric { first, .. } => Some(first.ip()),
            SymmetricNatResult::AssumedSymmetric => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SymmetricNatResult::NotSymmetric { .. } => "cone",
            SymmetricNatResult::Symmetric { .. } => "symmetric",
            SymmetricNatResult::AssumedSymmetric => "assumed_symmetric",
        }
    }
}

impl std::fmt::Display for SymmetricNatResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymmetricNatResult::NotSymmetric { mapped } => write!(f, "not symmetric ({})", mapped),
            SymmetricNatResult::Symmetric { first, second } => {
                write!(f, "symmetric ({} vs {})", first, second)
            }
            SymmetricNatResult::AssumedSymmetric => write!(f, "assumed symmetric"),
        }
    }
}

/// Compare two mappings; any difference in address or port means symmetric.
pub fn detect_symmetric_nat(first: SocketAddr, second: SocketAddr) -> bool {
    if first.port() != second.port() {
        info!(
            "Symmetric NAT detected: ports vary ({} vs {})",
            first.port(),
            second.port()
        );
        return true;
    }
    if first.ip() != second.ip() {
        info!(
            "Symmetric NAT detected: IPs vary ({} vs {})",
            first.ip(),
            second.ip()
        );
        return true;
    }
    false
}

/// STUN-backed reflector. Each query binds its own socket on the requested
/// port and releases it afterwards, so consecutive queries share the port.
pub struct StunReflector {
    query_timeout: Duration,
}

impl Default for StunReflector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl StunReflector {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    async fn resolve(&self, reflector: &str) -> AgentResult<SocketAddr> {
        let unavailable = |reason: String| AgentError::ReflectionUnavailable {
            reflector: reflector.to_string(),
            reason,
        };
        let mut addrs = timeout(Duration::from_secs(2), lookup_host(reflector))
            .await
            .map_err(|_| unavailable("DNS resolution timeout".to_string()))?
            .map_err(|e| unavailable(format!("DNS resolution failed: {}", e)))?;
        addrs
            .find(|a| a.is_ipv4())
            .ok_or_else(|| unavailable("no IPv4 address".to_string()))
    }
}

#[async_trait]
impl Reflector for StunReflector {
    async fn reflect(&self, reflector: &str, source_port: u16) -> AgentResult<SocketAddr> {
        let unavailable = |reason: String| AgentError::ReflectionUnavailable {
            reflector: reflector.to_string(),
            reason,
        };
        let server = self.resolve(reflector).await?;
        let socket = UdpSocket::bind(("0.0.0.0", source_port))
            .await
            .map_err(|e| unavailable(format!("bind to port {} failed: {}", source_port, e)))?;

        let tx_id: [u8; 12] = rand::random();
        socket
            .send_to(&build_binding_request(&tx_id), server)
            .await
            .map_err(|e| unavailable(format!("send failed: {}", e)))?;

        let mut buf = [0u8; 1024];
        let (n, _src) = timeout(self.query_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| unavailable("timeout".to_string()))?
            .map_err(|e| unavailable(format!("recv failed: {}", e)))?;

        let mapped = parse_binding_response(&buf[..n], &tx_id).map_err(unavailable)?;
        debug!("{} reflected local port {} as {}", reflector, source_port, mapped);
        Ok(mapped)
    }
}

/// Runs the two-reflector comparison.
pub struct NatClassifier<R: Reflector> {
    reflector: R,
    servers: [String; 2],
    retries: u32,
    backoff: Duration,
}

impl<R: Reflector> NatClassifier<R> {
    pub fn new(reflector: R) -> Self {
        Self {
            reflector,
            servers: DEFAULT_REFLECTORS.map(String::from),
            retries: 2,
            backoff: Duration::from_secs(1),
        }
    }

    /// Use a custom reflector pair. The two names must differ.
    pub fn with_servers(mut self, first: impl Into<String>, second: impl Into<String>) -> Self {
        self.servers = [first.into(), second.into()];
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// One classification attempt from `source_port`.
    pub async fn classify(&self, source_port: u16) -> AgentResult<SymmetricNatResult> {
        let first = self.reflector.reflect(&self.servers[0], source_port).await?;
        let second = self.reflector.reflect(&self.servers[1], source_port).await?;

        if detect_symmetric_nat(first, second) {
            Ok(SymmetricNatResult::Symmetric { first, second })
        } else {
            Ok(SymmetricNatResult::NotSymmetric { mapped: first })
        }
    }

    /// Classify with retries, falling back to [`SymmetricNatResult::AssumedSymmetric`].
    pub async fn classify_or_assume_symmetric(&self, source_port: u16) -> SymmetricNatResult {
        let mut delay = self.backoff;
        for attempt in 0..=self.retries {
            match self.classify(source_port).await {
                Ok(result) => {
                    info!("NAT classification from port {}: {}", source_port, result);
                    return result;
                }
                Err(e) if attempt < self.retries => {
                    debug!(
                        "NAT classification failed (attempt {}): {}, retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(
                        "NAT classification failed after {} attempts: {}; assuming symmetric NAT",
                        self.retries + 1,
                        e
                    );
                }
            }
        }
        SymmetricNatResult::AssumedSymmetric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedReflector;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_detect_symmetric_nat() {
        assert!(!detect_symmetric_nat(addr("1.2.3.4:5000"), addr("1.2.3.4:5000")));
        assert!(detect_symmetric_nat(addr("1.2.3.4:5000"), addr("1.2.3.4:5001")));
        assert!(detect_symmetric_nat(addr("1.2.3.4:5000"), addr("1.2.3.5:5000")));
    }

    #[tokio::test]
    async fn test_classify_cone() {
        let reflector = ScriptedReflector::new()
            .answer("r1", Ok(addr("203.0.113.1:40000")))
            .answer("r2", Ok(addr("203.0.113.1:40000")));
        let classifier = NatClassifier::new(reflector).with_servers("r1", "r2");

        let result = classifier.classify(51820).await.unwrap();
        assert!(!result.is_symmetric());
        assert_eq!(result.reflexive_ip(), Some("203.0.113.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_classify_symmetric() {
        let reflector = ScriptedReflector::new()
            .answer("r1", Ok(addr("203.0.113.1:40000")))
            .answer("r2", Ok(addr("203.0.113.1:40007")));
        let classifier = NatClassifier::new(reflector).with_servers("r1", "r2");

        let result = classifier.classify(51820).await.unwrap();
        assert!(result.is_symmetric());
        assert_eq!(result.label(), "symmetric");
    }

    #[tokio::test]
    async fn test_queries_share_source_port() {
        let reflector = ScriptedReflector::new()
            .answer("r1", Ok(addr("203.0.113.1:40000")))
            .answer("r2", Ok(addr("203.0.113.1:40000")));
        let classifier = NatClassifier::new(reflector).with_servers("r1", "r2");
        classifier.classify(4242).await.unwrap();

        let calls = classifier.reflector.calls();
        assert_eq!(calls, vec![("r1".to_string(), 4242), ("r2".to_string(), 4242)]);
    }

    #[tokio::test]
    async fn test_unreachable_reflector_is_an_error() {
        let reflector = ScriptedReflector::new().answer("r1", Ok(addr("203.0.113.1:40000")));
        let classifier = NatClassifier::new(reflector).with_servers("r1", "r2");

        let err = classifier.classify(51820).await.unwrap_err();
        assert!(matches!(err, AgentError::ReflectionUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_assumes_symmetric() {
        let classifier = NatClassifier::new(ScriptedReflector::new())
            .with_servers("r1", "r2")
            .with_retries(3, Duration::from_millis(500));

        let result = classifier.classify_or_assume_symmetric(51820).await;
        assert_eq!(result, SymmetricNatResult::AssumedSymmetric);
        assert!(result.is_symmetric());
        assert_eq!(result.reflexive_ip(), None);
        // one call to r1 per attempt; r2 is never reached
        assert_eq!(classifier.reflector.calls().len(), 4);
    }
}
