use base64::prelude::{Engine as _, BASE64_STANDARD};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::models::{CurrentStateRow, DeadLetterRow, NotificationRow};
use crate::error::Result;
use crate::types::{now_ms, CompetitiveSummary, ItemKey, NotificationStatus, Severity};

/// A freshly received notification, before it has been applied.
#[derive(Debug, Clone)]
pub struct NewNotification<'a> {
    pub id: &'a str,
    pub message_id: &'a str,
    pub dedupe_hash: &'a str,
    pub key: &'a ItemKey,
    pub raw_payload: &'a str,
    pub notification_type: &'a str,
    pub event_time_ms: i64,
    pub worker_id: &'a str,
}

/// Persistence for the ingestion side: notification records, the current-state
/// snapshot, the audit log and the dead-letter store.
///
/// Status lifecycle of a notification record: `new` on insert, `processing`
/// once claimed, then `completed` or `failed`.
#[derive(Clone)]
pub struct NotificationStore {
    pool: SqlitePool,
}

impl NotificationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the record in `new` state. Returns `false` when either the
    /// message id or the dedupe hash belongs to a record that was not `failed`.
    ///
    /// A `failed` record with the same message id or hash is removed first, so
    /// a replayed dead letter is processed again instead of being skipped.
    pub async fn insert_received(&self, n: &NewNotification<'_>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let reclaimed = sqlx::query(
            "DELETE FROM notifications WHERE status = ? AND (message_id = ? OR dedupe_hash = ?)",
        )
        .bind(NotificationStatus::Failed.to_string())
        .bind(n.message_id)
        .bind(n.dedupe_hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let res = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, message_id, dedupe_hash, item_id, marketplace, raw_payload,
                notification_type, event_time, status, received_at, worker_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(n.id)
        .bind(n.message_id)
        .bind(n.dedupe_hash)
        .bind(&n.key.item_id)
        .bind(&n.key.marketplace)
        .bind(n.raw_payload)
        .bind(n.notification_type)
        .bind(n.event_time_ms)
        .bind(NotificationStatus::New.to_string())
        .bind(now_ms())
        .bind(n.worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if reclaimed > 0 {
            info!(message_id = n.message_id, "reclaimed failed notification for replay");
        }
        Ok(res.rows_affected() == 1)
    }

    /// new → processing. Returns `false` if the record was not `new`.
    pub async fn mark_processing(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("UPDATE notifications SET status = ? WHERE id = ? AND status = ?")
            .bind(NotificationStatus::Processing.to_string())
            .bind(id)
            .bind(NotificationStatus::New.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE notifications SET status = ?, processed_at = ? WHERE id = ?")
            .bind(NotificationStatus::Failed.to_string())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fold a classified notification into `current_state`, audit the decision
    /// and mark the record `completed`, all in one transaction. The item is
    /// also registered in the scan catalog unless it is already listed there.
    ///
    /// The snapshot is left alone when the stored row came from a newer event,
    /// so out-of-order delivery cannot regress state; the record still
    /// completes, audited as `stale_skipped`. Returns whether the snapshot was
    /// written.
    pub async fn apply_notification(
        &self,
        notification_id: &str,
        key: &ItemKey,
        summary: &CompetitiveSummary,
        severity: Severity,
        event_time_ms: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let applied =
            upsert_current_state(&mut tx, notification_id, key, summary, severity, event_time_ms)
                .await?;
        sqlx::query(
            "INSERT INTO catalog_items (item_id, marketplace, active) VALUES (?, ?, 1) \
             ON CONFLICT (item_id, marketplace) DO NOTHING",
        )
        .bind(&key.item_id)
        .bind(&key.marketplace)
        .execute(&mut *tx)
        .await?;
        if applied {
            insert_audit(&mut tx, notification_id, key, "applied", Some(&severity.to_string()))
                .await?;
        } else {
            insert_audit(&mut tx, notification_id, key, "stale_skipped", None).await?;
        }

        sqlx::query(
            "UPDATE notifications SET status = ?, severity = ?, processed_at = ? WHERE id = ?",
        )
        .bind(NotificationStatus::Completed.to_string())
        .bind(severity.to_string())
        .bind(now_ms())
        .bind(notification_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(applied)
    }

    /// Create the dead-letter entry for `message_id`, or bump its failure count.
    /// The exact body is kept base64-encoded; `raw_message` holds it as text
    /// only when it is valid UTF-8.
    pub async fn record_dead_letter(
        &self,
        message_id: &str,
        body: &[u8],
        error_type: &str,
        error_message: &str,
    ) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                message_id, raw_message, raw_body, error_type, error_message,
                failure_count, first_failed_at, last_failed_at
            ) VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (message_id) DO UPDATE SET
                raw_message = excluded.raw_message,
                raw_body = excluded.raw_body,
                error_type = excluded.error_type,
                error_message = excluded.error_message,
                failure_count = dead_letters.failure_count + 1,
                last_failed_at = excluded.last_failed_at
            "#,
        )
        .bind(message_id)
        .bind(std::str::from_utf8(body).ok())
        .bind(BASE64_STANDARD.encode(body))
        .bind(error_type)
        .bind(error_message)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> Result<Option<NotificationRow>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT * FROM notifications WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_current_state(&self, key: &ItemKey) -> Result<Option<CurrentStateRow>> {
        let row = sqlx::query_as::<_, CurrentStateRow>(
            "SELECT * FROM current_state WHERE item_id = ? AND marketplace = ?",
        )
        .bind(&key.item_id)
        .bind(&key.marketplace)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Current-state rows in display order: most severe first, then most
    /// recently updated.
    pub async fn list_current_state(
        &self,
        min_severity: Option<Severity>,
        limit: i64,
    ) -> Result<Vec<CurrentStateRow>> {
        let min_rank = min_severity.map(Severity::rank).unwrap_or(0);
        let rows = sqlx::query_as::<_, CurrentStateRow>(
            r#"
            SELECT * FROM current_state
            WHERE severity_rank >= ?
            ORDER BY severity_rank DESC, last_updated DESC
            LIMIT ?
            "#,
        )
        .bind(min_rank)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRow>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT * FROM dead_letters ORDER BY last_failed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_dead_letter(&self, message_id: &str) -> Result<Option<DeadLetterRow>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT * FROM dead_letters WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Upsert the snapshot for `key` unless the stored row came from a newer
/// event. Returns whether the row was written.
async fn upsert_current_state(
    conn: &mut SqliteConnection,
    notification_id: &str,
    key: &ItemKey,
    summary: &CompetitiveSummary,
    severity: Severity,
    event_time_ms: i64,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO current_state (
            item_id, marketplace, your_price, market_low, prime_low, your_position,
            total_offers, is_buy_box_winner, severity, severity_rank,
            notification_id, source_event_time, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (item_id, marketplace) DO UPDATE SET
            your_price = excluded.your_price,
            market_low = excluded.market_low,
            prime_low = excluded.prime_low,
            your_position = excluded.your_position,
            total_offers = excluded.total_offers,
            is_buy_box_winner = excluded.is_buy_box_winner,
            severity = excluded.severity,
            severity_rank = excluded.severity_rank,
            notification_id = excluded.notification_id,
            source_event_time = excluded.source_event_time,
            last_updated = excluded.last_updated
        WHERE excluded.source_event_time >= current_state.source_event_time
        "#,
    )
    .bind(&key.item_id)
    .bind(&key.marketplace)
    .bind(summary.your_price)
    .bind(summary.market_low)
    .bind(summary.prime_low)
    .bind(summary.position.map(i64::from))
    .bind(i64::from(summary.total_offers))
    .bind(summary.is_buy_box_winner)
    .bind(severity.to_string())
    .bind(severity.rank())
    .bind(notification_id)
    .bind(event_time_ms)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;

    Ok(res.rows_affected() > 0)
}

async fn insert_audit(
    conn: &mut SqliteConnection,
    notification_id: &str,
    key: &ItemKey,
    action: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (notification_id, item_id, marketplace, action, detail, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(notification_id)
    .bind(&key.item_id)
    .bind(&key.marketplace)
    .bind(action)
    .bind(detail)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn key() -> ItemKey {
        ItemKey {
            item_id: "B001".to_string(),
            marketplace: "US".to_string(),
        }
    }

    fn summary(price: f64) -> CompetitiveSummary {
        CompetitiveSummary {
            your_price: Some(price),
            market_low: Some(9.0),
            prime_low: None,
            position: Some(2),
            total_offers: 4,
            is_buy_box_winner: false,
        }
    }

    async fn seed(store: &NotificationStore, id: &str, msg: &str, hash: &str, t: i64) -> bool {
        let k = key();
        store
            .insert_received(&NewNotification {
                id,
                message_id: msg,
                dedupe_hash: hash,
                key: &k,
                raw_payload: "{}",
                notification_type: "ANY_OFFER_CHANGED",
                event_time_ms: t,
                worker_id: "w1",
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unique_message_id_and_hash() {
        let store = NotificationStore::new(memory_pool().await);
        assert!(seed(&store, "n1", "m1", "h1", 1).await);
        assert!(!seed(&store, "n2", "m1", "h2", 1).await, "same message id");
        assert!(!seed(&store, "n3", "m2", "h1", 1).await, "same body hash");
        assert!(seed(&store, "n4", "m3", "h3", 1).await);

        let row = store.get_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(row.id, "n1");
        assert_eq!(row.status, "new");
        assert!(row.severity.is_none());

        assert!(store.mark_processing("n1").await.unwrap());
        assert!(!store.mark_processing("n1").await.unwrap(), "already processing");
        let row = store.get_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(row.status, "processing");
    }

    #[tokio::test]
    async fn failed_record_is_reclaimed_on_redelivery() {
        let store = NotificationStore::new(memory_pool().await);
        assert!(seed(&store, "n1", "m1", "h1", 1).await);
        store.mark_failed("n1").await.unwrap();

        assert!(seed(&store, "n2", "m1", "h1", 1).await, "failed record must not block");
        let row = store.get_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(row.id, "n2");
        assert_eq!(row.status, "new");

        // Once it is no longer failed, the same delivery is a duplicate again.
        assert!(!seed(&store, "n3", "m1", "h1", 1).await);
    }

    #[tokio::test]
    async fn older_event_does_not_overwrite() {
        let store = NotificationStore::new(memory_pool().await);
        seed(&store, "n1", "m1", "h1", 2_000).await;
        seed(&store, "n2", "m2", "h2", 1_000).await;

        assert!(store
            .apply_notification("n1", &key(), &summary(11.0), Severity::High, 2_000)
            .await
            .unwrap());
        assert!(!store
            .apply_notification("n2", &key(), &summary(10.0), Severity::Warning, 1_000)
            .await
            .unwrap());

        let row = store.get_current_state(&key()).await.unwrap().unwrap();
        assert_eq!(row.notification_id, "n1");
        assert_eq!(row.your_price, Some(11.0));
        assert_eq!(row.severity, "high");

        let stale = store.get_by_message_id("m2").await.unwrap().unwrap();
        assert_eq!(stale.status, "completed");
        assert_eq!(stale.severity.as_deref(), Some("warning"));

        let actions: Vec<String> =
            sqlx::query_scalar("SELECT action FROM audit_log ORDER BY id")
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(actions, vec!["applied", "stale_skipped"]);

        let listed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM catalog_items WHERE item_id = 'B001' AND active = 1",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(listed, 1);
    }

    #[tokio::test]
    async fn failed_apply_leaves_nothing_behind() {
        let store = NotificationStore::new(memory_pool().await);
        seed(&store, "n1", "m1", "h1", 1_000).await;
        sqlx::query("ALTER TABLE audit_log RENAME TO audit_log_parked")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store
            .apply_notification("n1", &key(), &summary(11.0), Severity::High, 1_000)
            .await
            .is_err());

        assert!(store.get_current_state(&key()).await.unwrap().is_none());
        let row = store.get_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(row.status, "new");
    }

    #[tokio::test]
    async fn dead_letter_increments() {
        let store = NotificationStore::new(memory_pool().await);
        store.record_dead_letter("m9", b"raw", "database", "boom").await.unwrap();
        store.record_dead_letter("m9", b"raw", "database", "boom again").await.unwrap();

        let dl = store.get_dead_letter("m9").await.unwrap().unwrap();
        assert_eq!(dl.failure_count, 2);
        assert_eq!(dl.error_message, "boom again");
        assert_eq!(dl.raw_message.as_deref(), Some("raw"));
        assert!(dl.last_failed_at >= dl.first_failed_at);
    }

    #[tokio::test]
    async fn dead_letter_keeps_exact_bytes() {
        let store = NotificationStore::new(memory_pool().await);
        let body = [0xff, 0xfe, b'{', 0x00, 0x80];
        store.record_dead_letter("bin", &body, "malformed", "not utf-8").await.unwrap();

        let dl = store.get_dead_letter("bin").await.unwrap().unwrap();
        assert_eq!(dl.raw_message, None);
        assert_eq!(dl.body().unwrap(), body.to_vec());
    }
}
