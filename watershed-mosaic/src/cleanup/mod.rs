//! Scratch directory reclamation.
//!
//! The [`CleanupCoordinator`] is the single consumer of acknowledgements sent
//! by every stitch worker. It counts acknowledgements per scratch directory
//! and deletes a directory once every declared output has merged its raster
//! from it. The count map is owned by the coordinator alone, so no lock is
//! involved.
//!
//! Deletion failures are logged and otherwise ignored: a leftover directory
//! never fails a run.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Message consumed by the [`CleanupCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupSignal {
    /// One output finished with this scratch directory.
    Ack(PathBuf),
    Close,
}

/// Summary of a coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Directories removed.
    pub deleted: usize,
    /// Directories fully acknowledged but kept on request.
    pub retained: usize,
    /// Directories fully acknowledged whose removal failed.
    pub failed: usize,
    /// Directories still short of acknowledgements at shutdown.
    pub pending: usize,
}

/// Reference-counts scratch directories and removes them.
#[derive(Debug)]
pub struct CleanupCoordinator {
    expected_acks: usize,
    keep_intermediate: bool,
    counts: HashMap<PathBuf, usize>,
    report: CleanupReport,
}

impl CleanupCoordinator {
    /// Creates a coordinator that reclaims a directory after
    /// `expected_acks` acknowledgements.
    pub fn new(expected_acks: usize, keep_intermediate: bool) -> Self {
        Self {
            expected_acks,
            keep_intermediate,
            counts: HashMap::new(),
            report: CleanupReport::default(),
        }
    }

    /// Processes signals until `Close` or until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CleanupSignal>) -> CleanupReport {
        while let Some(signal) = rx.recv().await {
            match signal {
                CleanupSignal::Ack(dir) => self.acknowledge(dir).await,
                CleanupSignal::Close => {
                    debug!("Cleanup coordinator received Close");
                    break;
                }
            }
        }

        self.report.pending = self.counts.len();
        if self.report.pending > 0 {
            warn!(pending = self.report.pending, "Scratch directories left unacknowledged");
        }
        info!(
            deleted = self.report.deleted,
            retained = self.report.retained,
            failed = self.report.failed,
            "Cleanup coordinator finished"
        );
        self.report
    }

    async fn acknowledge(&mut self, dir: PathBuf) {
        let count = self.counts.entry(dir.clone()).or_insert(0);
        *count += 1;
        if *count < self.expected_acks {
            debug!(dir = %dir.display(), count = *count, "Scratch directory acknowledged");
            return;
        }
        self.counts.remove(&dir);

        if self.keep_intermediate {
            debug!(dir = %dir.display(), "Keeping scratch directory");
            self.report.retained += 1;
            return;
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed scratch directory");
                self.report.deleted += 1;
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to remove scratch directory");
                self.report.failed += 1;
            }
        }
    }
}
