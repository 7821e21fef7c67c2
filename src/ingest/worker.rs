use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::INGEST_RECEIVE_BATCH;
use crate::db::notifications::NewNotification;
use crate::db::NotificationStore;
use crate::error::{AppError, Result};
use crate::ingest::envelope::{dedupe_hash, parse_envelope, NotificationEnvelope};
use crate::ingest::queue::{MessageSource, QueueMessage};
use crate::ingest::severity::{classify, SeverityInput, SeverityPolicy};
use crate::pool::RetryPolicy;
use crate::types::{ItemKey, Severity};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Current state now reflects this notification.
    Applied(Severity),
    /// Recorded, but a newer event already owns the current-state row.
    Stale(Severity),
    /// Message id or body was seen before; nothing written.
    Duplicate,
    DeadLettered,
}

/// Consumes notifications from a [`MessageSource`], deduplicates them and
/// folds them into `current_state`.
///
/// Every delivery is acknowledged once handled, whatever the outcome, so a
/// poison message cannot be redelivered forever. Failures land in the
/// dead-letter store instead.
pub struct IngestionWorker {
    source: Arc<dyn MessageSource>,
    store: NotificationStore,
    policy: SeverityPolicy,
    retry: RetryPolicy,
    worker_id: String,
    health: Arc<HealthState>,
}

impl IngestionWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: NotificationStore,
        policy: SeverityPolicy,
        retry: RetryPolicy,
        worker_id: String,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            source,
            store,
            policy,
            retry,
            worker_id,
            health,
        }
    }

    /// Consumer loop. Returns only when the source is closed.
    pub async fn run(self) {
        info!(worker_id = %self.worker_id, "ingestion worker started");
        self.health.set_ingest_alive(true);

        loop {
            let batch = match self.source.receive(INGEST_RECEIVE_BATCH).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => batch,
                Err(e) => {
                    error!("Queue receive error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in &batch {
                self.handle(message).await;
            }
        }

        self.health.set_ingest_alive(false);
        info!(worker_id = %self.worker_id, "ingestion worker stopped: source closed");
    }

    async fn handle(&self, message: &QueueMessage) {
        match self.process_message(message).await {
            Ok(outcome) => debug!(message_id = %message.message_id, ?outcome, "message handled"),
            Err(e) => error!(message_id = %message.message_id, "Failed to handle message: {e}"),
        }
        if let Err(e) = self.source.ack(message).await {
            error!(message_id = %message.message_id, "Ack failed: {e}");
        }
        self.health.inc_messages_handled();
    }

    /// Process one delivery end to end, without acknowledging it.
    pub async fn process_message(&self, message: &QueueMessage) -> Result<IngestOutcome> {
        debug!(
            message_id = %message.message_id,
            bytes = message.body.len(),
            attributes = ?message.attributes,
            "notification received"
        );

        let envelope = match parse_envelope(&message.body) {
            Ok(env) => env,
            Err(e) => {
                warn!(message_id = %message.message_id, "Rejecting notification: {e}");
                self.dead_letter(message, &e).await?;
                return Ok(IngestOutcome::DeadLettered);
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let key = envelope.key();
        let hash = dedupe_hash(&message.body);
        // A body that parsed as JSON is valid UTF-8.
        let raw = String::from_utf8_lossy(&message.body);
        let new = NewNotification {
            id: &id,
            message_id: &message.message_id,
            dedupe_hash: &hash,
            key: &key,
            raw_payload: &raw,
            notification_type: &envelope.notification_type,
            event_time_ms: envelope.event_time_ms(),
            worker_id: &self.worker_id,
        };

        let (store, new_ref) = (&self.store, &new);
        let inserted = self
            .retry
            .run("insert notification", AppError::is_transient_infra, move |_| {
                store.insert_received(new_ref)
            })
            .await;
        match inserted {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %message.message_id, %key, "duplicate notification");
                return Ok(IngestOutcome::Duplicate);
            }
            Err(e) => {
                self.dead_letter(message, &e).await?;
                return Ok(IngestOutcome::DeadLettered);
            }
        }

        let severity = classify(
            &SeverityInput::from(&envelope.payload.summary),
            &self.policy,
        );

        match self.apply(&id, &key, &envelope, severity).await {
            Ok(true) => Ok(IngestOutcome::Applied(severity)),
            Ok(false) => Ok(IngestOutcome::Stale(severity)),
            Err(e) => {
                error!(notification_id = %id, %key, "Failed to apply notification: {e}");
                if let Err(mark_err) = self.store.mark_failed(&id).await {
                    error!(notification_id = %id, "Failed to mark notification failed: {mark_err}");
                }
                self.dead_letter(message, &e).await?;
                Ok(IngestOutcome::DeadLettered)
            }
        }
    }

    /// Claim the record, then commit snapshot, audit entry and completion
    /// together.
    async fn apply(
        &self,
        id: &str,
        key: &ItemKey,
        envelope: &NotificationEnvelope,
        severity: Severity,
    ) -> Result<bool> {
        let store = &self.store;
        let summary = &envelope.payload.summary;
        let event_time_ms = envelope.event_time_ms();

        self.retry
            .run("claim notification", AppError::is_transient_infra, move |_| {
                store.mark_processing(id)
            })
            .await?;

        let applied = self
            .retry
            .run("apply notification", AppError::is_transient_infra, move |_| {
                store.apply_notification(id, key, summary, severity, event_time_ms)
            })
            .await?;

        if !applied {
            info!(notification_id = %id, %key, event_time_ms, "stale notification skipped");
        }
        Ok(applied)
    }

    async fn dead_letter(&self, message: &QueueMessage, err: &AppError) -> Result<()> {
        self.store
            .record_dead_letter(&message.message_id, &message.body, err.kind(), &err.to_string())
            .await
    }
}
