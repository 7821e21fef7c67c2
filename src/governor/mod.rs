pub mod rate_governor;

pub use rate_governor::{ClassUsage, RateGovernor};
