//! Typed notification envelope and the parse/validate boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::types::{CompetitiveSummary, ItemKey};

/// `{ notificationType, eventTime, payload: { itemId, marketplace, summary } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub notification_type: String,
    pub event_time: DateTime<Utc>,
    pub payload: NotificationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub item_id: String,
    pub marketplace: String,
    pub summary: CompetitiveSummary,
}

impl NotificationEnvelope {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            item_id: self.payload.item_id.clone(),
            marketplace: self.payload.marketplace.clone(),
        }
    }

    pub fn event_time_ms(&self) -> i64 {
        self.event_time.timestamp_millis()
    }
}

/// Hex-encoded SHA-256 of the raw message body.
pub fn dedupe_hash(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

/// Parse and validate a raw body. Every failure is `AppError::Malformed`:
/// the same bytes will never parse on a retry.
pub fn parse_envelope(body: &[u8]) -> Result<NotificationEnvelope> {
    let env: NotificationEnvelope =
        serde_json::from_slice(body).map_err(|e| AppError::Malformed(e.to_string()))?;
    validate(&env)?;
    Ok(env)
}

fn validate(env: &NotificationEnvelope) -> Result<()> {
    if env.notification_type.trim().is_empty() {
        return Err(AppError::Malformed("notificationType is empty".to_string()));
    }
    if env.payload.item_id.trim().is_empty() {
        return Err(AppError::Malformed("payload.itemId is empty".to_string()));
    }
    if env.payload.marketplace.trim().is_empty() {
        return Err(AppError::Malformed("payload.marketplace is empty".to_string()));
    }

    let s = &env.payload.summary;
    for (name, value) in [
        ("yourPrice", s.your_price),
        ("marketLow", s.market_low),
        ("primeLow", s.prime_low),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(AppError::Malformed(format!("summary.{name} is not a valid price: {v}")));
            }
        }
    }
    if s.position == Some(0) {
        return Err(AppError::Malformed("summary.position is 1-based".to_string()));
    }
    if let Some(pos) = s.position {
        if pos > s.total_offers {
            return Err(AppError::Malformed(format!(
                "summary.position {pos} exceeds totalOffers {}",
                s.total_offers
            )));
        }
    }
    Ok(())
}
