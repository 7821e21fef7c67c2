pub mod envelope;
pub mod queue;
pub mod severity;
pub mod worker;

pub use queue::{ChannelSender, ChannelSource, QueueMessage};
pub use worker::IngestionWorker;
