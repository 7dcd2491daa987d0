//! The transport abstraction shared by client and agent.

use crate::error::Result;
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long `receive` waits for the first message of a batch.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(100);

/// Addressed, best-effort message exchange for one sandbox.
///
/// Client and agent use the same trait against mirrored bindings.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Sandbox id stamped on outgoing messages and required on incoming ones.
    fn owner_id(&self) -> &str;

    /// Publish a message. Fire-and-forget: there is no acknowledgement and
    /// the message may be dropped.
    fn send(&self, message_type: MessageType, payload: Value);

    /// Return whatever arrives within one poll window, minus messages owned
    /// by other sandboxes. An empty batch means nothing arrived in time.
    async fn receive(&self) -> Vec<Message>;
}

/// Typed helpers over [`Communicator`].
pub trait CommunicatorExt: Communicator {
    /// Serialize `payload` and send it.
    fn send_payload<T: Serialize>(&self, message_type: MessageType, payload: &T) -> Result<()> {
        self.send(message_type, serde_json::to_value(payload)?);
        Ok(())
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// Drop every message not owned by `owner_id`.
pub(crate) fn retain_owned(mut batch: Vec<Message>, owner_id: &str) -> Vec<Message> {
    let before = batch.len();
    batch.retain(|m| m.owner_id() == owner_id);
    let dropped = before - batch.len();
    if dropped > 0 {
        tracing::trace!(owner_id, dropped, "Discarded messages for other sandboxes");
    }
    batch
}

/// Wait up to `window` for one message, then take everything already queued.
pub(crate) async fn drain_window(
    inbound: &mut mpsc::Receiver<Message>,
    window: Duration,
) -> Vec<Message> {
    let mut batch = Vec::new();
    match tokio::time::timeout(window, inbound.recv()).await {
        Ok(Some(message)) => batch.push(message),
        Ok(None) => {
            // Every producer is gone. Sleep out the window so callers that
            // loop on receive() still pace themselves.
            tokio::time::sleep(window).await;
            return batch;
        }
        Err(_) => return batch,
    }
    while let Ok(message) = inbound.try_recv() {
        batch.push(message);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retain_owned_filters_foreign() {
        let batch = vec![
            Message::new("tb-1", MessageType::Pong, json!({})),
            Message::new("tb-2", MessageType::Pong, json!({})),
            Message::new("tb-1", MessageType::ExecStatus, json!({})),
        ];
        let kept = retain_owned(batch, "tb-1");
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|m| m.owner_id() == "tb-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_window_returns_empty_after_window() {
        let (_tx, mut rx) = mpsc::channel::<Message>(4);
        let start = tokio::time::Instant::now();
        let batch = drain_window(&mut rx, Duration::from_millis(100)).await;
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_drain_window_takes_queued_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(Message::new("tb-1", MessageType::Pong, json!({ "i": i })))
                .await
                .unwrap();
        }
        let batch = drain_window(&mut rx, Duration::from_millis(100)).await;
        let order: Vec<_> = batch.iter().map(|m| m.payload()["i"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
    }
}
