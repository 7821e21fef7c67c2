//! Shared health state for the /health endpoint.
//! Updated by the ingestion worker, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::types::now_ms;

pub struct HealthState {
    started_at_ms: i64,
    /// True while the ingestion consumer loop is running.
    ingest_alive: AtomicBool,
    /// Messages the ingestion worker has finished with (any outcome).
    messages_handled: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at_ms: now_ms(),
            ingest_alive: AtomicBool::new(false),
            messages_handled: AtomicU64::new(0),
        }
    }

    pub fn set_ingest_alive(&self, v: bool) {
        self.ingest_alive.store(v, Ordering::Relaxed);
    }

    pub fn ingest_alive(&self) -> bool {
        self.ingest_alive.load(Ordering::Relaxed)
    }

    pub fn inc_messages_handled(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_handled(&self) -> u64 {
        self.messages_handled.load(Ordering::Relaxed)
    }

    /// Seconds since the process started.
    pub fn uptime_secs(&self) -> u64 {
        ((now_ms() - self.started_at_ms).max(0) / 1_000) as u64
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
