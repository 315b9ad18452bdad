//! Batch task trait and outcomes.
//!
//! A batch task is the unit of work the scheduler runs once per batch. The
//! production task is [`BatchJob`](super::BatchJob); tests substitute their
//! own implementations to observe scheduling.
//!
//! # Example
//!
//! ```ignore
//! use watershed_mosaic::executor::{BatchTask, JobOutcome, JobError};
//!
//! struct Noop;
//!
//! impl BatchTask for Noop {
//!     fn name(&self) -> &str { "Noop" }
//!
//!     fn execute<'a>(&'a self, batch: &'a BatchDescriptor) -> TaskFuture<'a> {
//!         Box::pin(async move { Ok(JobOutcome::Skipped) })
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::batch::BatchDescriptor;

use super::job::JobError;

/// Boxed future returned by [`BatchTask::execute`].
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<JobOutcome, JobError>> + Send + 'a>>;

/// One unit of work per batch.
pub trait BatchTask: Send + Sync + 'static {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Runs the batch.
    ///
    /// `Ok` outcomes are [`JobOutcome::Skipped`] or [`JobOutcome::Emitted`];
    /// the scheduler turns errors into [`JobOutcome::Failed`].
    fn execute<'a>(&'a self, batch: &'a BatchDescriptor) -> TaskFuture<'a>;
}

/// Final state of one batch.
#[derive(Debug)]
pub enum JobOutcome {
    /// Disjoint from the global extent; `Skip` was sent to every output.
    Skipped,
    /// The model ran and every output received its raster.
    Emitted,
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn is_emitted(&self) -> bool {
        matches!(self, Self::Emitted)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Emitted => write!(f, "emitted"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}
