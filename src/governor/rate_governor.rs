//! Minimum-spacing rate governor, one slot per external API class.
//!
//! Each class owns its `last_request` timestamp behind an async mutex that is
//! held across the wait. Concurrent callers of the same class therefore queue
//! up behind each other and the spacing holds no matter how many pool workers
//! share the governor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Timing {
    last_request: Option<Instant>,
    request_count: u64,
}

#[derive(Debug)]
struct ClassSlot {
    min_delay: Duration,
    timing: Mutex<Timing>,
}

impl ClassSlot {
    fn new(min_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_delay,
            timing: Mutex::new(Timing::default()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassUsage {
    pub api_class: String,
    pub min_delay_ms: u64,
    pub request_count: u64,
}

pub struct RateGovernor {
    classes: DashMap<String, Arc<ClassSlot>>,
    /// Spacing for classes that were not configured up front.
    default_delay: Duration,
}

impl RateGovernor {
    /// `delays` is `(api_class, min_delay_ms)`.
    pub fn new(delays: Vec<(String, u64)>, default_delay_ms: u64) -> Arc<Self> {
        let classes = DashMap::new();
        for (class, ms) in delays {
            classes.insert(class, ClassSlot::new(Duration::from_millis(ms)));
        }
        Arc::new(Self {
            classes,
            default_delay: Duration::from_millis(default_delay_ms),
        })
    }

    /// Wait until a call against `api_class` is allowed, then claim the slot.
    pub async fn acquire(&self, api_class: &str) {
        let slot = self.slot(api_class);
        let mut timing = slot.timing.lock().await;

        if let Some(last) = timing.last_request {
            let elapsed = last.elapsed();
            if elapsed < slot.min_delay {
                let wait = slot.min_delay - elapsed;
                debug!(api_class, wait_ms = wait.as_millis() as u64, "rate governor waiting");
                tokio::time::sleep(wait).await;
            }
        }

        timing.last_request = Some(Instant::now());
        timing.request_count += 1;
    }

    /// Spacing and calls granted so far for every class seen, sorted by name.
    pub async fn usage(&self) -> Vec<ClassUsage> {
        let slots: Vec<(String, Arc<ClassSlot>)> = self
            .classes
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for (api_class, slot) in slots {
            let request_count = slot.timing.lock().await.request_count;
            out.push(ClassUsage {
                api_class,
                min_delay_ms: slot.min_delay.as_millis() as u64,
                request_count,
            });
        }
        out.sort_by(|a, b| a.api_class.cmp(&b.api_class));
        out
    }

    pub fn min_delay(&self, api_class: &str) -> Duration {
        self.classes
            .get(api_class)
            .map(|r| r.value().min_delay)
            .unwrap_or(self.default_delay)
    }

    fn slot(&self, api_class: &str) -> Arc<ClassSlot> {
        // Clone the Arc out so the DashMap shard guard is released before we await.
        if let Some(existing) = self.classes.get(api_class) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .classes
            .entry(api_class.to_string())
            .or_insert_with(|| ClassSlot::new(self.default_delay));
        Arc::clone(entry.value())
    }
}
