//! Batch execution: run a job over the stored files a filter selects.

pub mod engine;
pub mod filter;
pub mod job;
pub mod jobs;
pub mod registry;
pub mod status;

pub use engine::BatchRunner;
pub use filter::{Filter, FilterSpec};
pub use job::{BatchJob, RecordJob, RecordScan};
pub use registry::JobRegistry;
pub use status::BatchStatus;
