//! TCP transport.
//!
//! A channel has a binding side and a connecting side, independent of its
//! direction. The agent binds both of its ports and the client connects to
//! both, so only the agent has to be reachable.
//!
//! - A bound publish side fans every message out to all connected peers.
//!   With nobody connected the message is dropped.
//! - A connected publish side buffers until the connection is up and
//!   reconnects when it breaks.
//! - Subscribe sides push decoded frames into a bounded queue that
//!   [`Communicator::receive`] drains.

use crate::codec::{self, frame_codec};
use crate::communicator::{drain_window, retain_owned, Communicator, DEFAULT_POLL_WINDOW};
use crate::error::{ProtoError, Result};
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Messages buffered per outbound peer before the oldest are dropped.
const OUTBOUND_CAPACITY: usize = 1024;

/// Messages buffered inbound before new arrivals are dropped.
const INBOUND_CAPACITY: usize = 1024;

/// Pause between connection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// How one side of a channel reaches its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Listen on `host:port`. Port 0 picks a free port.
    Bind(String),
    /// Dial `host:port`.
    Connect(String),
}

impl Endpoint {
    pub fn bind(addr: impl Into<String>) -> Self {
        Self::Bind(addr.into())
    }

    pub fn connect(addr: impl Into<String>) -> Self {
        Self::Connect(addr.into())
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Bind(addr) | Self::Connect(addr) => addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(addr) => write!(f, "bind tcp://{addr}"),
            Self::Connect(addr) => write!(f, "connect tcp://{addr}"),
        }
    }
}

/// Externally reachable addresses of an agent, as seen from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    /// Where the agent publishes (client subscribes here).
    pub publish: String,
    /// Where the agent subscribes (client publishes here).
    pub subscribe: String,
}

impl EndpointPair {
    pub fn new(host: &str, publish_port: u16, subscribe_port: u16) -> Self {
        Self {
            publish: format!("{host}:{publish_port}"),
            subscribe: format!("{host}:{subscribe_port}"),
        }
    }
}

/// Owner id plus the two channel endpoints of one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub owner_id: String,
    pub publish: Endpoint,
    pub subscribe: Endpoint,
}

impl ChannelBinding {
    /// Agent side: bind both ports.
    pub fn agent(
        owner_id: impl Into<String>,
        publish_addr: impl Into<String>,
        subscribe_addr: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            publish: Endpoint::bind(publish_addr),
            subscribe: Endpoint::bind(subscribe_addr),
        }
    }

    /// Client side: the mirror image of the agent's addresses.
    pub fn client(owner_id: impl Into<String>, agent: &EndpointPair) -> Self {
        Self {
            owner_id: owner_id.into(),
            publish: Endpoint::connect(agent.subscribe.clone()),
            subscribe: Endpoint::connect(agent.publish.clone()),
        }
    }
}

/// [`Communicator`] over two TCP channels.
///
/// Background tasks stop when the communicator is dropped.
pub struct TcpCommunicator {
    owner_id: String,
    outbound: broadcast::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    poll_window: Duration,
    publish_addr: Option<SocketAddr>,
    subscribe_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl TcpCommunicator {
    /// Bind listeners and start the background tasks for `binding`.
    ///
    /// Connecting endpoints do not wait for the peer. They keep dialing in
    /// the background until the communicator is dropped.
    pub async fn open(binding: ChannelBinding) -> Result<Self> {
        for endpoint in [&binding.publish, &binding.subscribe] {
            if endpoint.address().trim().is_empty() {
                return Err(ProtoError::InvalidAddress(endpoint.address().to_string()));
            }
        }

        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = broadcast::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let publish_addr = match &binding.publish {
            Endpoint::Bind(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                drop(outbound_rx);
                tokio::spawn(serve_publish(listener, outbound.clone(), shutdown.clone()));
                Some(local)
            }
            Endpoint::Connect(addr) => {
                tokio::spawn(dial_publish(addr.clone(), outbound_rx, shutdown.clone()));
                None
            }
        };

        let subscribe_addr = match &binding.subscribe {
            Endpoint::Bind(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                tokio::spawn(serve_subscribe(listener, inbound_tx, shutdown.clone()));
                Some(local)
            }
            Endpoint::Connect(addr) => {
                tokio::spawn(dial_subscribe(addr.clone(), inbound_tx, shutdown.clone()));
                None
            }
        };

        tracing::debug!(
            owner_id = %binding.owner_id,
            publish = %binding.publish,
            subscribe = %binding.subscribe,
            "Opened channel binding"
        );

        Ok(Self {
            owner_id: binding.owner_id,
            outbound,
            inbound: Mutex::new(inbound_rx),
            poll_window: DEFAULT_POLL_WINDOW,
            publish_addr,
            subscribe_addr,
            shutdown,
        })
    }

    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }

    /// Local address of a bound publish side.
    pub fn publish_addr(&self) -> Option<SocketAddr> {
        self.publish_addr
    }

    /// Local address of a bound subscribe side.
    pub fn subscribe_addr(&self) -> Option<SocketAddr> {
        self.subscribe_addr
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Communicator for TcpCommunicator {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn send(&self, message_type: MessageType, payload: Value) {
        let message = Message::new(self.owner_id.clone(), message_type, payload);
        if self.outbound.send(message).is_err() {
            tracing::trace!(owner_id = %self.owner_id, %message_type, "No peer connected, message dropped");
        }
    }

    async fn receive(&self) -> Vec<Message> {
        let mut inbound = self.inbound.lock().await;
        let batch = drain_window(&mut inbound, self.poll_window).await;
        retain_owned(batch, &self.owner_id)
    }
}

// ============================================================================
// Publish side
// ============================================================================

async fn serve_publish(
    listener: TcpListener,
    outbound: broadcast::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Subscriber connected");
                let mut rx = outbound.subscribe();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    forward_outbound(stream, &mut rx, &shutdown).await;
                    tracing::debug!(%peer, "Subscriber disconnected");
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept subscriber");
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}

async fn dial_publish(
    addr: String,
    mut rx: broadcast::Receiver<Message>,
    shutdown: CancellationToken,
) {
    while let Some(stream) = dial(&addr, &shutdown).await {
        if forward_outbound(stream, &mut rx, &shutdown).await {
            return;
        }
        if pause(&shutdown).await {
            return;
        }
    }
}

/// Write outbound messages to one stream until it fails. Returns `true` when
/// the communicator is shutting down.
async fn forward_outbound(
    stream: TcpStream,
    rx: &mut broadcast::Receiver<Message>,
    shutdown: &CancellationToken,
) -> bool {
    let mut sink = FramedWrite::new(stream, frame_codec());
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return true,
            received = rx.recv() => match received {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Outbound backlog overflowed, messages dropped");
                    continue;
                }
                Err(RecvError::Closed) => return true,
            },
        };
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Outbound stream closed");
            return false;
        }
    }
}

// ============================================================================
// Subscribe side
// ============================================================================

async fn serve_subscribe(
    listener: TcpListener,
    inbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Publisher connected");
                let inbound = inbound.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    read_inbound(stream, &inbound, &shutdown).await;
                    tracing::debug!(%peer, "Publisher disconnected");
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept publisher");
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}

async fn dial_subscribe(addr: String, inbound: mpsc::Sender<Message>, shutdown: CancellationToken) {
    while let Some(stream) = dial(&addr, &shutdown).await {
        if read_inbound(stream, &inbound, &shutdown).await {
            return;
        }
        if pause(&shutdown).await {
            return;
        }
    }
}

/// Queue frames from one stream until it ends. Returns `true` when the
/// communicator is shutting down.
async fn read_inbound(
    stream: TcpStream,
    inbound: &mpsc::Sender<Message>,
    shutdown: &CancellationToken,
) -> bool {
    let mut frames = FramedRead::new(stream, frame_codec());
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return true,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => match codec::decode(&frame) {
                Ok(message) => match inbound.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        tracing::warn!(
                            message_type = %message.message_type(),
                            "Inbound queue full, message dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => return true,
                },
                Err(e) => tracing::warn!(error = %e, "Discarding malformed frame"),
            },
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Inbound stream failed");
                return false;
            }
            None => return false,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Dial until connected. Returns `None` on shutdown.
async fn dial(addr: &str, shutdown: &CancellationToken) -> Option<TcpStream> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return None,
            attempt = TcpStream::connect(addr) => attempt,
        };
        match attempt {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
                }
                tracing::debug!(addr, attempts, "Connected");
                return Some(stream);
            }
            Err(e) => {
                tracing::trace!(addr, attempt = attempts, error = %e, "Connection attempt failed, retrying...");
                if pause(shutdown).await {
                    return None;
                }
            }
        }
    }
}

/// Sleep one reconnect interval. Returns `true` on shutdown.
async fn pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_INTERVAL) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_pair(owner: &str) -> (TcpCommunicator, TcpCommunicator) {
        let agent = TcpCommunicator::open(ChannelBinding::agent(owner, "127.0.0.1:0", "127.0.0.1:0"))
            .await
            .unwrap();
        let pair = EndpointPair {
            publish: agent.publish_addr().unwrap().to_string(),
            subscribe: agent.subscribe_addr().unwrap().to_string(),
        };
        let client = TcpCommunicator::open(ChannelBinding::client(owner, &pair))
            .await
            .unwrap();
        (agent, client)
    }

    async fn receive_until(comm: &TcpCommunicator, attempts: usize) -> Vec<Message> {
        for _ in 0..attempts {
            let batch = comm.receive().await;
            if !batch.is_empty() {
                return batch;
            }
        }
        Vec::new()
    }

    #[test]
    fn test_client_binding_mirrors_agent() {
        let pair = EndpointPair::new("10.0.0.7", 5555, 5556);
        let binding = ChannelBinding::client("tb-1", &pair);
        assert_eq!(binding.publish, Endpoint::connect("10.0.0.7:5556"));
        assert_eq!(binding.subscribe, Endpoint::connect("10.0.0.7:5555"));
    }

    #[tokio::test]
    async fn test_open_rejects_empty_address() {
        let binding = ChannelBinding::agent("tb-1", "", "127.0.0.1:0");
        assert!(matches!(
            TcpCommunicator::open(binding).await,
            Err(ProtoError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_client_to_agent_round_trip() {
        let (agent, client) = open_pair("tb-1").await;

        // Buffered on the dialing side until the connection is up.
        let payload = json!({"command": "ls", "args": [{"deep": [1, 2]}]});
        client.send(MessageType::ExecRequest, payload.clone());

        let batch = receive_until(&agent, 50).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_type(), MessageType::ExecRequest);
        assert_eq!(batch[0].payload(), &payload);
    }

    #[tokio::test]
    async fn test_agent_to_client_after_connect() {
        let (agent, client) = open_pair("tb-1").await;

        // The bound publisher drops messages until a subscriber is connected,
        // so keep publishing until one gets through.
        let mut received = Vec::new();
        for _ in 0..50 {
            agent.send(MessageType::Pong, json!({"n": 1}));
            received = client.receive().await;
            if !received.is_empty() {
                break;
            }
        }
        assert!(!received.is_empty());
        assert!(received.iter().all(|m| m.message_type() == MessageType::Pong));
    }

    #[tokio::test]
    async fn test_foreign_owner_filtered_on_shared_port() {
        let agent = TcpCommunicator::open(ChannelBinding::agent("tb-1", "127.0.0.1:0", "127.0.0.1:0"))
            .await
            .unwrap();
        let pair = EndpointPair {
            publish: agent.publish_addr().unwrap().to_string(),
            subscribe: agent.subscribe_addr().unwrap().to_string(),
        };
        let intruder = TcpCommunicator::open(ChannelBinding::client("tb-2", &pair))
            .await
            .unwrap();
        let client = TcpCommunicator::open(ChannelBinding::client("tb-1", &pair))
            .await
            .unwrap();

        intruder.send(MessageType::ExecRequest, json!({"from": "tb-2"}));
        client.send(MessageType::ExecRequest, json!({"from": "tb-1"}));

        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.extend(agent.receive().await);
        }
        assert!(seen.iter().any(|m| m.payload()["from"] == "tb-1"));
        assert!(seen.iter().all(|m| m.owner_id() == "tb-1"));
    }
}
