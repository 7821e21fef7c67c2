use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Alert level of a competitive snapshot.
///
/// Variants are declared lowest-first so the derived `Ord` gives
/// `Critical > High > Warning > Info > Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Info,
    Warning,
    High,
    Critical,
}

impl Severity {
    /// Integer rank persisted next to the label so SQL can sort by it.
    pub fn rank(self) -> i64 {
        match self {
            Severity::Success => 0,
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Severity::Success),
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Success => "success",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Sort rows for display: most severe first, stable within a level.
pub fn sort_for_display<T>(rows: &mut [T], severity_of: impl Fn(&T) -> Severity) {
    rows.sort_by(|a, b| severity_of(b).cmp(&severity_of(a)));
}

// ---------------------------------------------------------------------------
// Notification lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    New,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationStatus::New => "new",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Completed => "completed",
            NotificationStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Competitive summary, shared by notifications and scan results
// ---------------------------------------------------------------------------

/// Competitive position of one item on one marketplace at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitiveSummary {
    pub your_price: Option<f64>,
    pub market_low: Option<f64>,
    pub prime_low: Option<f64>,
    pub position: Option<u32>,
    pub total_offers: u32,
    pub is_buy_box_winner: bool,
}

/// Key of a current-state row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    pub item_id: String,
    pub marketplace: String,
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.item_id, self.marketplace)
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
