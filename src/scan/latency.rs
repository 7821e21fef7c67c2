//! Per-class latency of pricing calls. Each governor class keeps two
//! histograms: time spent waiting on the governor, and time spent in the
//! upstream call itself. Values are microseconds.

use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::warn;

/// Upper bound of both histograms: 10 minutes.
const MAX_TRACKED_US: u64 = 600_000_000;

struct ClassHistograms {
    wait: Histogram<u64>,
    call: Histogram<u64>,
}

impl ClassHistograms {
    fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            wait: Histogram::new_with_bounds(1, MAX_TRACKED_US, 3)?,
            call: Histogram::new_with_bounds(1, MAX_TRACKED_US, 3)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    GovernorWait,
    Call,
}

/// p50/p95/p99 in milliseconds; `None` when the histogram is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl Percentiles {
    fn of(h: &Histogram<u64>) -> Self {
        let at = |q: f64| (h.len() > 0).then(|| h.value_at_quantile(q) as f64 / 1_000.0);
        Self {
            samples: h.len(),
            p50_ms: at(0.5),
            p95_ms: at(0.95),
            p99_ms: at(0.99),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassLatency {
    pub api_class: String,
    pub governor_wait: Percentiles,
    pub call: Percentiles,
}

#[derive(Default)]
pub struct PricingLatency {
    classes: DashMap<String, ClassHistograms>,
}

impl PricingLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_wait(&self, api_class: &str, d: Duration) {
        self.record(api_class, Phase::GovernorWait, d);
    }

    pub fn record_call(&self, api_class: &str, d: Duration) {
        self.record(api_class, Phase::Call, d);
    }

    fn record(&self, api_class: &str, phase: Phase, d: Duration) {
        if !self.classes.contains_key(api_class) {
            match ClassHistograms::new() {
                Ok(h) => {
                    self.classes.entry(api_class.to_string()).or_insert(h);
                }
                Err(e) => {
                    warn!(api_class, "cannot create latency histogram: {e:?}");
                    return;
                }
            }
        }
        let Some(mut slot) = self.classes.get_mut(api_class) else {
            return;
        };
        let us = d.as_micros().min(u128::from(MAX_TRACKED_US)) as u64;
        match phase {
            Phase::GovernorWait => slot.wait.saturating_record(us),
            Phase::Call => slot.call.saturating_record(us),
        }
    }

    /// Stats for every class with at least one sample, sorted by class.
    pub fn snapshot(&self) -> Vec<ClassLatency> {
        let mut out: Vec<ClassLatency> = self
            .classes
            .iter()
            .map(|r| ClassLatency {
                api_class: r.key().clone(),
                governor_wait: Percentiles::of(&r.value().wait),
                call: Percentiles::of(&r.value().call),
            })
            .collect();
        out.sort_by(|a, b| a.api_class.cmp(&b.api_class));
        out
    }
}
