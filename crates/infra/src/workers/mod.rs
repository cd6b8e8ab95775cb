//! Background workers: one group of pollers per step queue.

mod stats;
mod step_worker;

pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use step_worker::{WorkerPool, WorkerPoolHandle};
