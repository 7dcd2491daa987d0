//! In-process transport.
//!
//! A [`MemoryBus`] carries traffic for any number of sandboxes in both
//! directions, like a shared broker would. It is used by tests and by
//! embedders that run client and agent in one process.

use crate::communicator::{retain_owned, Communicator, DEFAULT_POLL_WINDOW};
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 256;

/// Shared two-way bus. Cloning shares the same channels.
#[derive(Clone)]
pub struct MemoryBus {
    to_agent: broadcast::Sender<Message>,
    to_client: broadcast::Sender<Message>,
    drop_to_agent: Arc<AtomicUsize>,
    drop_to_client: Arc<AtomicUsize>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus whose per-receiver backlog holds `capacity` messages. Older
    /// messages are dropped once a receiver falls further behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (to_agent, _) = broadcast::channel(capacity);
        let (to_client, _) = broadcast::channel(capacity);
        Self {
            to_agent,
            to_client,
            drop_to_agent: Arc::new(AtomicUsize::new(0)),
            drop_to_client: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Client-facing end for `owner_id`.
    pub fn client(&self, owner_id: impl Into<String>) -> MemoryCommunicator {
        MemoryCommunicator {
            owner_id: owner_id.into(),
            outbound: self.to_agent.clone(),
            inbound: Mutex::new(self.to_client.subscribe()),
            drops: self.drop_to_agent.clone(),
            poll_window: DEFAULT_POLL_WINDOW,
        }
    }

    /// Agent-facing end for `owner_id`.
    pub fn agent(&self, owner_id: impl Into<String>) -> MemoryCommunicator {
        MemoryCommunicator {
            owner_id: owner_id.into(),
            outbound: self.to_client.clone(),
            inbound: Mutex::new(self.to_agent.subscribe()),
            drops: self.drop_to_client.clone(),
            poll_window: DEFAULT_POLL_WINDOW,
        }
    }

    /// Silently lose the next `count` messages sent towards agents.
    pub fn drop_next_to_agent(&self, count: usize) {
        self.drop_to_agent.fetch_add(count, Ordering::SeqCst);
    }

    /// Silently lose the next `count` messages sent towards clients.
    pub fn drop_next_to_client(&self, count: usize) {
        self.drop_to_client.fetch_add(count, Ordering::SeqCst);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One end of a [`MemoryBus`].
pub struct MemoryCommunicator {
    owner_id: String,
    outbound: broadcast::Sender<Message>,
    inbound: Mutex<broadcast::Receiver<Message>>,
    drops: Arc<AtomicUsize>,
    poll_window: Duration,
}

impl MemoryCommunicator {
    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }
}

#[async_trait]
impl Communicator for MemoryCommunicator {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn send(&self, message_type: MessageType, payload: Value) {
        if self
            .drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::trace!(owner_id = %self.owner_id, %message_type, "Dropping message");
            return;
        }
        let message = Message::new(self.owner_id.clone(), message_type, payload);
        // No receivers is the same as loss.
        let _ = self.outbound.send(message);
    }

    async fn receive(&self) -> Vec<Message> {
        let mut inbound = self.inbound.lock().await;
        let mut batch = Vec::new();
        let deadline = tokio::time::Instant::now() + self.poll_window;

        // Wait for the first message, skipping over lag notifications.
        loop {
            match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Ok(message)) => {
                    batch.push(message);
                    break;
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(owner_id = %self.owner_id, skipped, "Receiver lagged, messages lost");
                }
                Ok(Err(RecvError::Closed)) => {
                    tokio::time::sleep_until(deadline).await;
                    return batch;
                }
                Err(_) => return batch,
            }
        }

        loop {
            match inbound.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(owner_id = %self.owner_id, skipped, "Receiver lagged, messages lost");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        retain_owned(batch, &self.owner_id)
    }
}
