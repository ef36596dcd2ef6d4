//! Device registry lookups (device id → public key).

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

/// Registry view of a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Device {
    #[serde(alias = "device-id")]
    pub id: String,
    #[serde(alias = "publicKey", alias = "public_key")]
    pub public_key: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Fails with [`AgentError::DeviceNotFound`] when the registry has no such device.
    async fn get_device(&self, device_id: &str) -> AgentResult<Device>;
}

/// HTTP registry client for `GET {api}/api/devices/{id}`.
pub struct HttpDeviceRegistry {
    client: Client,
    base_url: String,
}

impl HttpDeviceRegistry {
    pub fn new(base_url: &str, request_timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Registry(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn device_url(&self, device_id: &str) -> String {
        format!("{}/api/devices/{}", self.base_url, device_id)
    }
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn get_device(&self, device_id: &str) -> AgentResult<Device> {
        let url = self.device_url(device_id);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Registry(format!("GET {} failed: {}", url, e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(AgentError::DeviceNotFound(device_id.to_string())),
            status if !status.is_success() => Err(AgentError::Registry(format!(
                "GET {} returned {}",
                url, status
            ))),
            _ => resp
                .json::<Device>()
                .await
                .map_err(|e| AgentError::Registry(format!("invalid device response: {}", e))),
        }
    }
}
