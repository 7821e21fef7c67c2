//! Database row types matching `migrations/0001_init.sql`.
//! Timestamps are epoch milliseconds.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Serialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRow {
    pub id: String,
    pub message_id: String,
    pub dedupe_hash: String,
    pub item_id: String,
    pub marketplace: String,
    pub raw_payload: String,
    pub notification_type: String,
    pub event_time: i64,
    pub severity: Option<String>,
    pub status: String,
    pub received_at: i64,
    pub processed_at: Option<i64>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStateRow {
    pub item_id: String,
    pub marketplace: String,
    pub your_price: Option<f64>,
    pub market_low: Option<f64>,
    pub prime_low: Option<f64>,
    pub your_position: Option<i64>,
    pub total_offers: i64,
    pub is_buy_box_winner: bool,
    pub severity: String,
    pub severity_rank: i64,
    pub notification_id: String,
    pub source_event_time: i64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRow {
    pub message_id: String,
    /// Body as text; `None` when it is not valid UTF-8.
    pub raw_message: Option<String>,
    /// Exact body bytes, base64.
    pub raw_body: String,
    pub error_type: String,
    pub error_message: String,
    pub failure_count: i64,
    pub first_failed_at: i64,
    pub last_failed_at: i64,
}

impl DeadLetterRow {
    /// Original body bytes, for replay.
    pub fn body(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(&self.raw_body)
            .map_err(|e| AppError::Malformed(format!("dead letter {}: bad raw_body: {e}", self.message_id)))
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobRow {
    pub id: String,
    pub status: String,
    pub source: String,
    pub filter_type: Option<String>,
    pub total_items: i64,
    pub successful_items: i64,
    pub failed_items: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResultRow {
    pub id: i64,
    pub job_id: String,
    pub item_id: String,
    pub marketplace: String,
    pub your_price: Option<f64>,
    pub market_low: Option<f64>,
    pub prime_low: Option<f64>,
    pub position: Option<i64>,
    pub total_offers: i64,
    pub is_winner: bool,
    /// JSON array of competitor offers as captured.
    pub competitor_offers: String,
    pub captured_at: i64,
}
