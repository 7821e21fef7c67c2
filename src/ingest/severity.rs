use crate::types::{CompetitiveSummary, Severity};

/// Inputs to the classifier, lifted out of a notification or a scan snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityInput {
    pub your_price: Option<f64>,
    pub market_low: Option<f64>,
    pub prime_low: Option<f64>,
    pub position: Option<u32>,
    pub total_offers: u32,
    pub is_winner: bool,
}

impl From<&CompetitiveSummary> for SeverityInput {
    fn from(s: &CompetitiveSummary) -> Self {
        Self {
            your_price: s.your_price,
            market_low: s.market_low,
            prime_low: s.prime_low,
            position: s.position,
            total_offers: s.total_offers,
            is_winner: s.is_buy_box_winner,
        }
    }
}

/// Business thresholds. Supplied by configuration; the defaults only exist so
/// a fresh deployment classifies something sensible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityPolicy {
    /// Price gap over the market low (fraction, 0.10 = 10%) that is critical.
    pub critical_gap_pct: f64,
    /// Price gap over the market low (or prime low) that is high.
    pub high_gap_pct: f64,
    /// Offer-list positions beyond this are critical.
    pub critical_position: u32,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            critical_gap_pct: 0.10,
            high_gap_pct: 0.03,
            critical_position: 5,
        }
    }
}

/// Classify a competitive snapshot. Pure; no I/O, no clock.
pub fn classify(input: &SeverityInput, policy: &SeverityPolicy) -> Severity {
    let Some(your_price) = input.your_price else {
        return Severity::Info;
    };
    if input.total_offers == 0 {
        return Severity::Info;
    }
    if input.is_winner && input.position.map_or(true, |p| p == 1) {
        return Severity::Success;
    }

    let gap = |low: Option<f64>| match low {
        Some(low) if low > 0.0 => (your_price - low) / low,
        _ => 0.0,
    };
    let market_gap = gap(input.market_low);
    let prime_gap = gap(input.prime_low);

    if market_gap >= policy.critical_gap_pct
        || input.position.is_some_and(|p| p > policy.critical_position)
    {
        return Severity::Critical;
    }
    if market_gap >= policy.high_gap_pct || prime_gap >= policy.high_gap_pct {
        return Severity::High;
    }
    if !input.is_winner {
        return Severity::Warning;
    }
    Severity::Info
}
