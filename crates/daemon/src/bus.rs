//! Coordinator message bus client.
//!
//! One TCP connection carries length-delimited JSON frames (4-byte big-endian
//! length prefix): `{"op":"subscribe","channel":..}` and
//! `{"op":"publish","channel":..,"payload":..}` from the node,
//! `{"op":"message","channel":..,"payload":..}` from the coordinator.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{AgentError, AgentResult};
use crate::messages::{
    HEALTHCHECK_REPLY, HEALTHCHECK_REPLY_CHANNEL, HEALTHCHECK_REQUEST, HEALTHCHECK_REQUEST_CHANNEL,
};

/// Upper bound on one frame; a roster of thousands of peers fits comfortably.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame {
    Subscribe { channel: String },
    Publish { channel: String, payload: String },
    Message { channel: String, payload: String },
}

/// Publish/subscribe transport to the coordinator.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, channel: &str) -> AgentResult<()>;
    async fn publish(&self, channel: &str, payload: &str) -> AgentResult<()>;
    /// Next inbound message on any subscribed channel.
    async fn recv(&self) -> AgentResult<BusMessage>;
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

pub struct TcpBus {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    coordinator: SocketAddr,
}

impl TcpBus {
    pub async fn connect(coordinator: &str) -> AgentResult<Self> {
        let stream = TcpStream::connect(coordinator)
            .await
            .map_err(|e| AgentError::Transport(format!("failed to connect to {}: {}", coordinator, e)))?;
        stream.set_nodelay(true)?;
        let coordinator = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        info!("Message bus connected to {}", coordinator);
        Ok(Self {
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            coordinator,
        })
    }

    pub fn coordinator(&self) -> SocketAddr {
        self.coordinator
    }

    async fn send_frame(&self, frame: &Frame) -> AgentResult<()> {
        let data = serde_json::to_vec(frame)?;
        self.writer
            .lock()
            .await
            .send(Bytes::from(data))
            .await
            .map_err(|e| AgentError::Transport(format!("send to {} failed: {}", self.coordinator, e)))
    }
}

#[async_trait]
impl MessageBus for TcpBus {
    async fn subscribe(&self, channel: &str) -> AgentResult<()> {
        debug!("Subscribing to {}", channel);
        self.send_frame(&Frame::Subscribe {
            channel: channel.to_string(),
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> AgentResult<()> {
        self.send_frame(&Frame::Publish {
            channel: channel.to_string(),
            payload: payload.to_string(),
        })
        .await
    }

    async fn recv(&self) -> AgentResult<BusMessage> {
        let mut reader = self.reader.lock().await;
        loop {
            let data = match reader.next().await {
                Some(Ok(data)) => data,
                Some(Err(e)) => return Err(AgentError::Transport(format!("recv failed: {}", e))),
                None => {
                    return Err(AgentError::Transport(format!(
                        "connection to {} closed",
                        self.coordinator
                    )))
                }
            };
            match serde_json::from_slice::<Frame>(&data) {
                Ok(Frame::Message { channel, payload }) => return Ok(BusMessage { channel, payload }),
                Ok(other) => debug!("Ignoring unexpected frame {:?}", other),
                Err(e) => debug!("Ignoring malformed frame ({} bytes): {}", data.len(), e),
            }
        }
    }
}

/// Ask the coordinator whether it is ready, waiting at most `within`.
pub async fn wait_until_ready(bus: &dyn MessageBus, within: Duration) -> AgentResult<()> {
    bus.subscribe(HEALTHCHECK_REPLY_CHANNEL).await?;
    bus.publish(HEALTHCHECK_REQUEST_CHANNEL, HEALTHCHECK_REQUEST).await?;

    let wait = async {
        loop {
            let msg = bus.recv().await?;
            if msg.channel == HEALTHCHECK_REPLY_CHANNEL && msg.payload == HEALTHCHECK_REPLY {
                return Ok::<(), AgentError>(());
            }
            debug!("Ignoring {} message while waiting for readiness", msg.channel);
        }
    };
    match timeout(within, wait).await {
        Ok(result) => {
            result?;
            info!("Coordinator is ready");
            Ok(())
        }
        Err(_) => Err(AgentError::CoordinatorUnavailable(within)),
    }
}

/// Forward inbound bus messages into the agent loop's queue, in arrival order.
pub fn spawn_pump(bus: Arc<dyn MessageBus>, tx: mpsc::Sender<BusMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        debug!("Agent loop gone, stopping bus pump");
                        return;
                    }
                }
                Err(e) => {
                    warn!("Message bus receive failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}
