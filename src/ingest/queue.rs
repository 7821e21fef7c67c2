use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{AppError, Result};

/// One delivery from the queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Transport-level delivery identifier.
    pub message_id: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// Source of queue deliveries. `receive` returning an empty batch means the
/// source is closed and the consumer should stop.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Remove the message from the queue so it is not redelivered.
    async fn ack(&self, message: &QueueMessage) -> Result<()>;
}

/// In-process queue. Producers push through [`ChannelSender`]; the HTTP
/// intake endpoint is one such producer.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<QueueMessage>>,
}

#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<QueueMessage>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (ChannelSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSender { tx }, Self { rx: Mutex::new(rx) })
    }
}

impl ChannelSender {
    pub async fn send(&self, message: QueueMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|e| AppError::ChannelSend(format!("queue closed: {e}")))
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut rx = self.rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Ok(Vec::new());
        };

        let mut batch = vec![first];
        while batch.len() < max.max(1) {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn ack(&self, _message: &QueueMessage) -> Result<()> {
        // Channel delivery is destructive; nothing to acknowledge.
        Ok(())
    }
}
