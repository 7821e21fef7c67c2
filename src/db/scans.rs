use sqlx::SqlitePool;

use crate::db::models::{ScanJobRow, ScanResultRow};
use crate::error::Result;
use crate::scan::job::{ScanFilter, ScanSource, ScanStatus};
use crate::types::{now_ms, CompetitiveSummary, ItemKey, Severity};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Flag set; the scanner will stop before its next batch.
    Requested,
    /// Job had already finished. Nothing to do.
    AlreadyTerminal(ScanStatus),
    NotFound,
}

/// Persistence for bulk scans: target resolution, job records and captured results.
#[derive(Clone)]
pub struct ScanStore {
    pool: SqlitePool,
}

impl ScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Item keys a new scan should visit, in stable key order.
    pub async fn resolve_targets(
        &self,
        source: ScanSource,
        filter: ScanFilter,
        max_items: Option<i64>,
    ) -> Result<Vec<ItemKey>> {
        let (alias, from) = match source {
            ScanSource::Catalog => (
                "t",
                "FROM catalog_items t \
                 LEFT JOIN current_state cs \
                   ON cs.item_id = t.item_id AND cs.marketplace = t.marketplace \
                 WHERE t.active = 1",
            ),
            ScanSource::CurrentState => ("cs", "FROM current_state cs WHERE 1 = 1"),
        };
        let (condition, min_rank) = match filter {
            ScanFilter::All => ("", None),
            ScanFilter::LosingBuyBox => (" AND cs.is_buy_box_winner = 0", None),
            ScanFilter::Critical => (" AND cs.severity_rank >= ?", Some(Severity::High.rank())),
        };
        // LIMIT -1 means no limit in SQLite.
        let sql = format!(
            "SELECT {alias}.item_id, {alias}.marketplace {from}{condition} \
             ORDER BY {alias}.item_id, {alias}.marketplace LIMIT ?"
        );

        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        if let Some(rank) = min_rank {
            query = query.bind(rank);
        }
        let rows = query
            .bind(max_items.filter(|n| *n > 0).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(item_id, marketplace)| ItemKey { item_id, marketplace })
            .collect())
    }

    pub async fn create_job(
        &self,
        id: &str,
        source: ScanSource,
        filter: ScanFilter,
        total_items: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs (id, status, source, filter_type, total_items, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(ScanStatus::Pending.to_string())
        .bind(source.to_string())
        .bind(filter.to_string())
        .bind(total_items)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<ScanJobRow>> {
        let row = sqlx::query_as::<_, ScanJobRow>("SELECT * FROM scan_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// pending → running. Returns `false` if the job was not pending.
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE scan_jobs SET status = ?, started_at = ? WHERE id = ? AND status IN ({})",
            status_list(ScanStatus::Running)
        );
        let res = sqlx::query(&sql)
            .bind(ScanStatus::Running.to_string())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn request_cancel(&self, id: &str) -> Result<CancelOutcome> {
        let res = sqlx::query(
            "UPDATE scan_jobs SET cancel_requested = 1 \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(CancelOutcome::Requested);
        }

        match self.get_job(id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(job) => Ok(CancelOutcome::AlreadyTerminal(
                ScanStatus::parse(&job.status).unwrap_or(ScanStatus::Completed),
            )),
        }
    }

    pub async fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM scan_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    pub async fn update_counts(&self, id: &str, succeeded: u64, failed: u64) -> Result<()> {
        sqlx::query("UPDATE scan_jobs SET successful_items = ?, failed_items = ? WHERE id = ?")
            .bind(succeeded as i64)
            .bind(failed as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move the job to a terminal `status` with its final counts. The update
    /// only applies from a legal predecessor state; returns whether it did.
    pub async fn finish(
        &self,
        id: &str,
        status: ScanStatus,
        succeeded: u64,
        failed: u64,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE scan_jobs \
             SET status = ?, successful_items = ?, failed_items = ?, \
                 completed_at = ?, error_message = ? \
             WHERE id = ? AND status IN ({})",
            status_list(status)
        );
        let res = sqlx::query(&sql)
            .bind(status.to_string())
            .bind(succeeded as i64)
            .bind(failed as i64)
            .bind(now_ms())
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Record the capture for one item of a job. Results are write-once: a
    /// second capture for the same item is ignored and `false` returned.
    pub async fn insert_result(
        &self,
        job_id: &str,
        key: &ItemKey,
        summary: &CompetitiveSummary,
        competitor_offers: &str,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO scan_results (
                job_id, item_id, marketplace, your_price, market_low, prime_low,
                position, total_offers, is_winner, competitor_offers, captured_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_id, item_id, marketplace) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&key.item_id)
        .bind(&key.marketplace)
        .bind(summary.your_price)
        .bind(summary.market_low)
        .bind(summary.prime_low)
        .bind(summary.position.map(i64::from))
        .bind(i64::from(summary.total_offers))
        .bind(summary.is_buy_box_winner)
        .bind(competitor_offers)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_results(&self, job_id: &str) -> Result<Vec<ScanResultRow>> {
        let rows = sqlx::query_as::<_, ScanResultRow>(
            "SELECT * FROM scan_results WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert or update catalog entries in one transaction. Returns how many
    /// entries were written.
    pub async fn upsert_catalog(&self, entries: &[(ItemKey, bool)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for (key, active) in entries {
            sqlx::query(
                r#"
                INSERT INTO catalog_items (item_id, marketplace, active) VALUES (?, ?, ?)
                ON CONFLICT (item_id, marketplace) DO UPDATE SET active = excluded.active
                "#,
            )
            .bind(&key.item_id)
            .bind(&key.marketplace)
            .bind(*active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(entries.len() as u64)
    }
}

/// `'a', 'b'` list of the states `next` may be entered from.
fn status_list(next: ScanStatus) -> String {
    let list: Vec<String> = next
        .allowed_predecessors()
        .iter()
        .map(|s| format!("'{s}'"))
        .collect();
    if list.is_empty() {
        // Nothing may move into this state; match no rows.
        "NULL".to_string()
    } else {
        list.join(", ")
    }
}
