pub mod job;
pub mod latency;
pub mod orchestrator;
pub mod pricing;

pub use job::{ScanFilter, ScanProgress, ScanRequest, ScanSource, ScanStatus};
pub use latency::ClassLatency;
pub use orchestrator::{ScanCreated, ScanOrchestrator, ScanSettings};
pub use pricing::HttpPricingClient;
