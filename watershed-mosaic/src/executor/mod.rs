//! Batch execution.
//!
//! The [`JobScheduler`] runs one [`BatchTask`] per batch on a bounded pool of
//! worker tasks, highest priority first. [`BatchJob`] is the production task:
//! it aligns the model inputs for a batch, runs the region model and hands
//! each declared output to its stitch worker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       JobScheduler                        │
//! │                                                           │
//! │  batches ──► PriorityQueue (priority = -index)            │
//! │                    │                                      │
//! │          ┌─────────┼─────────┐   `workers` tokio tasks    │
//! │          ▼         ▼         ▼                            │
//! │       BatchJob  BatchJob  BatchJob                        │
//! │          │ spawn_blocking: align inputs, run model        │
//! │          ▼                                                │
//! │    Item / Skip ──► one bounded channel per output         │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod job;
mod policy;
mod queue;
mod scheduler;
mod task;

pub use job::{BatchJob, JobContext, JobError, OutputTarget, DATA_DIR};
pub use policy::Priority;
pub use queue::{PriorityQueue, Queued};
pub use scheduler::{default_workers, JobRecord, JobScheduler, ScheduleReport, SchedulerConfig};
pub use task::{BatchTask, JobOutcome, TaskFuture};
