pub mod retry;
pub mod worker_pool;

pub use retry::RetryPolicy;
pub use worker_pool::{partition_batches, run_bounded, PoolProgress};
