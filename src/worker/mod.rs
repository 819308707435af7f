//! Bounded worker pool for blocking and outbound work.

pub mod pool;

pub use pool::{DEFAULT_POOL_SIZE, WorkerPool};
