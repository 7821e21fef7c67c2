use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::ingest::severity::SeverityPolicy;
use crate::pool::retry::RetryPolicy;

pub const PRICING_API_URL: &str = "https://pricing.marketplace.example.com";

/// API class used by the bulk scanner for per-item offer listings.
pub const API_CLASS_ITEM_OFFERS: &str = "item_offers";

/// API class for the batch competitive-pricing endpoint.
pub const API_CLASS_COMPETITIVE_PRICING: &str = "competitive_pricing";

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the per-job progress broadcast channel. Slow SSE subscribers
/// that fall further behind than this skip ahead.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Messages pulled from the queue per receive call.
pub const INGEST_RECEIVE_BATCH: usize = 10;

/// Backoff applied to in-process retries of transient store errors.
pub const INGEST_DB_RETRY_BASE_MS: u64 = 50;
pub const INGEST_DB_RETRY_CAP_MS: u64 = 1_000;
pub const INGEST_DB_RETRY_JITTER_MS: u64 = 25;

/// Default page size for list endpoints.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Base URL of the external pricing API (PRICING_API_URL)
    pub pricing_api_url: String,
    /// Bearer token for the pricing API (PRICING_API_TOKEN), optional
    pub pricing_api_token: Option<String>,
    /// Identifier recorded on every notification this process handles (WORKER_ID)
    pub worker_id: String,
    /// Minimum spacing per API class, in milliseconds.
    pub rate_delays: Vec<(String, u64)>,
    /// Spacing for API classes without an explicit entry (RATE_DELAY_DEFAULT_MS)
    pub rate_delay_default_ms: u64,
    /// Items per scan batch (SCAN_BATCH_SIZE)
    pub scan_batch_size: usize,
    /// Worker pool concurrency inside one batch (SCAN_CONCURRENCY)
    pub scan_concurrency: usize,
    /// Sleep between batches (SCAN_BATCH_COOLDOWN_MS)
    pub scan_batch_cooldown_ms: u64,
    pub retry_max: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_jitter_ms: u64,
    /// Per-attempt budget for external calls (REQUEST_TIMEOUT_SECS)
    pub request_timeout_secs: u64,
    /// In-process retries for transient store errors during ingestion (INGEST_DB_RETRIES)
    pub ingest_db_retries: u32,
    pub severity: SeverityPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = SeverityPolicy::default();

        let cfg = Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "pricewatch.db".to_string()),
            api_port: env_or("API_PORT", 3000)?,
            pricing_api_url: std::env::var("PRICING_API_URL")
                .unwrap_or_else(|_| PRICING_API_URL.to_string()),
            pricing_api_token: std::env::var("PRICING_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| {
                format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
            }),
            rate_delays: vec![
                (
                    API_CLASS_ITEM_OFFERS.to_string(),
                    env_or("RATE_DELAY_ITEM_OFFERS_MS", 2_100)?,
                ),
                (
                    API_CLASS_COMPETITIVE_PRICING.to_string(),
                    env_or("RATE_DELAY_COMPETITIVE_PRICING_MS", 1_100)?,
                ),
            ],
            rate_delay_default_ms: env_or("RATE_DELAY_DEFAULT_MS", 1_100)?,
            scan_batch_size: env_or("SCAN_BATCH_SIZE", 20)?,
            scan_concurrency: env_or("SCAN_CONCURRENCY", 1)?,
            scan_batch_cooldown_ms: env_or("SCAN_BATCH_COOLDOWN_MS", 5_000)?,
            retry_max: env_or("RETRY_MAX", 5)?,
            retry_base_ms: env_or("RETRY_BASE_MS", 1_000)?,
            retry_cap_ms: env_or("RETRY_CAP_MS", 30_000)?,
            retry_jitter_ms: env_or("RETRY_JITTER_MS", 500)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30)?,
            ingest_db_retries: env_or("INGEST_DB_RETRIES", 3)?,
            severity: SeverityPolicy {
                critical_gap_pct: env_or("SEVERITY_CRITICAL_GAP_PCT", defaults.critical_gap_pct)?,
                high_gap_pct: env_or("SEVERITY_HIGH_GAP_PCT", defaults.high_gap_pct)?,
                critical_position: env_or(
                    "SEVERITY_CRITICAL_POSITION",
                    defaults.critical_position,
                )?,
            },
        };
        cfg.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.scan_batch_size == 0 {
            return Err(AppError::Config("SCAN_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.scan_concurrency == 0 {
            return Err(AppError::Config("SCAN_CONCURRENCY must be at least 1".to_string()));
        }
        if self.retry_cap_ms < self.retry_base_ms {
            return Err(AppError::Config(
                "RETRY_CAP_MS must not be below RETRY_BASE_MS".to_string(),
            ));
        }
        Ok(self)
    }

    /// Retry policy for calls against the external pricing API.
    pub fn scan_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max,
            base_ms: self.retry_base_ms,
            cap_ms: self.retry_cap_ms,
            jitter_ms: self.retry_jitter_ms,
            attempt_timeout: Some(Duration::from_secs(self.request_timeout_secs)),
        }
    }

    /// Retry policy for transient store errors while applying a notification.
    pub fn ingest_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.ingest_db_retries,
            base_ms: INGEST_DB_RETRY_BASE_MS,
            cap_ms: INGEST_DB_RETRY_CAP_MS,
            jitter_ms: INGEST_DB_RETRY_JITTER_MS,
            attempt_timeout: None,
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
/// A value that is present but unparsable is a configuration error.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_when_unset() {
        let v: u64 = env_or("PRICEWATCH_TEST_SURELY_UNSET", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_or_rejects_garbage() {
        std::env::set_var("PRICEWATCH_TEST_GARBAGE_PORT", "not-a-port");
        let err = env_or::<u16>("PRICEWATCH_TEST_GARBAGE_PORT", 3000).unwrap_err();
        assert!(matches!(err, AppError::Config(_)), "got {err:?}");
    }
}
