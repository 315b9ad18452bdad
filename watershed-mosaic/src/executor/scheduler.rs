//! Bounded worker pool running one task per batch.
//!
//! All batches are queued up front with priority `-index`; a fixed number of
//! worker tasks then drain the queue. With the pool saturated, batches start
//! in submission order, which the batcher makes descending area order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::batch::BatchDescriptor;

use super::policy::Priority;
use super::queue::PriorityQueue;
use super::job::JobError;
use super::task::{BatchTask, JobOutcome};

/// Scheduler parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of batches running concurrently.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Available parallelism, or 1 when it cannot be determined.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Outcome of one batch.
#[derive(Debug)]
pub struct JobRecord {
    /// Position in the submitted batch list.
    pub index: usize,
    pub job_id: String,
    pub outcome: JobOutcome,
}

/// Result of a scheduler run, in submission order.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub jobs: Vec<JobRecord>,
    /// Workers that panicked outside a batch; their batches have no record.
    pub panicked_workers: usize,
}

impl ScheduleReport {
    pub fn skipped(&self) -> usize {
        self.jobs.iter().filter(|j| j.outcome.is_skipped()).count()
    }

    pub fn emitted(&self) -> usize {
        self.jobs.iter().filter(|j| j.outcome.is_emitted()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.iter().filter(|j| j.outcome.is_failed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.outcome.is_failed())
    }

    /// True when every batch was skipped or emitted.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.panicked_workers == 0
    }
}

/// Runs a [`BatchTask`] over every batch on a bounded worker pool.
#[derive(Debug, Clone, Default)]
pub struct JobScheduler {
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs `task` once per batch and waits for all of them.
    ///
    /// A failing batch never stops the others; its error is recorded in the
    /// report.
    pub async fn run(&self, batches: Vec<BatchDescriptor>, task: Arc<dyn BatchTask>) -> ScheduleReport {
        let total = batches.len();
        let mut queue = PriorityQueue::with_capacity(total);
        for (index, batch) in batches.into_iter().enumerate() {
            queue.push((index, batch), Priority::for_index(index));
        }
        let queue = Arc::new(Mutex::new(queue));

        let workers = self.config.workers.max(1).min(total.max(1));
        let started = Instant::now();
        info!(task = task.name(), batches = total, workers, "Scheduling batches");

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let task = Arc::clone(&task);
                tokio::spawn(async move {
                    let mut records = Vec::new();
                    loop {
                        let next = queue.lock().pop();
                        let Some(entry) = next else {
                            break;
                        };
                        let wait_ms = entry.wait_time().as_millis() as u64;
                        let priority = entry.priority;
                        let (index, batch) = entry.item;
                        debug!(worker, job_id = %batch.job_id, %priority, wait_ms, "Batch started");

                        let outcome = match AssertUnwindSafe(task.execute(&batch))
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(outcome)) => outcome,
                            Ok(Err(e)) => {
                                error!(job_id = %batch.job_id, error = %e, "Batch failed");
                                JobOutcome::Failed(e)
                            }
                            Err(_) => {
                                error!(job_id = %batch.job_id, "Batch panicked");
                                JobOutcome::Failed(JobError::Panicked {
                                    job_id: batch.job_id.clone(),
                                })
                            }
                        };
                        debug!(worker, job_id = %batch.job_id, %outcome, "Batch finished");
                        records.push(JobRecord {
                            index,
                            job_id: batch.job_id,
                            outcome,
                        });
                    }
                    records
                })
            })
            .collect();

        let mut report = ScheduleReport::default();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(records) => report.jobs.extend(records),
                Err(e) => {
                    error!(error = %e, "Scheduler worker panicked");
                    report.panicked_workers += 1;
                }
            }
        }
        report.jobs.sort_by_key(|j| j.index);

        info!(
            task = task.name(),
            emitted = report.emitted(),
            skipped = report.skipped(),
            failed = report.failed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "All batches finished"
        );
        report
    }
}
