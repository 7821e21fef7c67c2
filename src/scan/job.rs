use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled)
    }

    /// pending → running → {completed | failed | cancelled}. A pending job may
    /// also be cancelled or failed before it ever starts.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        match (self, next) {
            (ScanStatus::Pending, ScanStatus::Running) => true,
            (ScanStatus::Pending, ScanStatus::Cancelled | ScanStatus::Failed) => true,
            (ScanStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }

    /// States a job may be in for a move to `self` to be legal.
    pub fn allowed_predecessors(self) -> &'static [&'static str] {
        match self {
            ScanStatus::Pending => &[],
            ScanStatus::Running => &["pending"],
            ScanStatus::Completed => &["running"],
            ScanStatus::Failed | ScanStatus::Cancelled => &["pending", "running"],
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            "cancelled" => Some(ScanStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Target selection
// ---------------------------------------------------------------------------

/// Where a scan's item universe comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    /// Active rows of `catalog_items`.
    Catalog,
    /// Keys already tracked in `current_state`.
    CurrentState,
}

impl ScanSource {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "catalog" => Ok(ScanSource::Catalog),
            "current_state" => Ok(ScanSource::CurrentState),
            other => Err(AppError::BadRequest(format!("unknown scan source: {other}"))),
        }
    }
}

impl std::fmt::Display for ScanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanSource::Catalog => write!(f, "catalog"),
            ScanSource::CurrentState => write!(f, "current_state"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    All,
    /// Items whose last known snapshot shows someone else holding the buy box.
    LosingBuyBox,
    /// Items whose last known severity is high or critical.
    Critical,
}

impl ScanFilter {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("all") => Ok(ScanFilter::All),
            Some("losing_buy_box") => Ok(ScanFilter::LosingBuyBox),
            Some("critical") => Ok(ScanFilter::Critical),
            Some(other) => Err(AppError::BadRequest(format!("unknown filter type: {other}"))),
        }
    }
}

impl std::fmt::Display for ScanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanFilter::All => "all",
            ScanFilter::LosingBuyBox => "losing_buy_box",
            ScanFilter::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Parsed `POST /scan` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub source: ScanSource,
    pub filter: ScanFilter,
    /// Cap on the number of targets; `None` scans everything that matches.
    pub max_items: Option<i64>,
}

/// Events published to a job's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum ScanProgress {
    #[serde(rename_all = "camelCase")]
    BatchStarted {
        job_id: String,
        batch: usize,
        total_batches: usize,
        batch_size: usize,
    },
    /// Running totals for the whole job.
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: String,
        processed: u64,
        succeeded: u64,
        failed: u64,
        total: u64,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        job_id: String,
        status: ScanStatus,
        succeeded: u64,
        failed: u64,
    },
}

impl ScanProgress {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ScanProgress::BatchStarted { .. } => "batchStarted",
            ScanProgress::Progress { .. } => "progress",
            ScanProgress::Finished { .. } => "finished",
        }
    }
}
