//! Stitch workers.
//!
//! Every declared model output has one [`StitchWorker`] that owns the
//! output's global mosaic. Batch jobs send it [`StitchMessage`]s over a
//! bounded channel; the worker buffers arriving rasters and merges them into
//! the mosaic in flushes, then acknowledges each merged raster's scratch
//! directory to the cleanup coordinator.
//!
//! # Message flow
//!
//! ```text
//! batch jobs ──Item/Skip──► [bounded mpsc] ──► StitchWorker ──Ack(dir)──► CleanupCoordinator
//!                                                  │
//!                                                  ▼
//!                                               mosaic
//! ```
//!
//! A flush happens when the buffer grows past the flush threshold, and once
//! more on `Close` for whatever is left. Within a flush rasters are applied
//! in arrival order and the last writer wins where they overlap. Values are
//! area weighted: each is rescaled from its source pixel area to the mosaic
//! pixel area.

mod progress;

pub use progress::{Progress, ProgressSnapshot};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cleanup::CleanupSignal;
use crate::raster::{OverlapPolicy, RasterError, RasterStore, ResampleMethod, StitchOptions};

/// Default number of buffered rasters that triggers a merge once exceeded.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

// =============================================================================
// Messages
// =============================================================================

/// A per-job raster ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchItem {
    pub raster_path: PathBuf,
    /// Scratch directory acknowledged once the raster is merged.
    pub scratch_dir: PathBuf,
    /// Progress units this message accounts for.
    pub weight: usize,
}

impl StitchItem {
    /// Item whose scratch directory is the raster's parent directory.
    pub fn new(raster_path: impl Into<PathBuf>) -> Self {
        let raster_path = raster_path.into();
        let scratch_dir = raster_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            raster_path,
            scratch_dir,
            weight: 1,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

/// Message consumed by a [`StitchWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StitchMessage {
    Item(StitchItem),
    /// A batch produced nothing for this output.
    Skip,
    /// No more messages; flush and stop.
    Close,
}

// =============================================================================
// Errors and report
// =============================================================================

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("failed to merge {count} rasters into {output}: {source}")]
    Merge {
        output: String,
        count: usize,
        source: RasterError,
    },

    #[error("merge task for {output} panicked")]
    Panicked { output: String },
}

/// Summary of one worker's run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StitchReport {
    pub output: String,
    /// Progress units consumed (items and skips).
    pub processed: usize,
    /// Rasters merged into the mosaic.
    pub merged: usize,
    pub flushes: usize,
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StitchConfig {
    pub flush_threshold: usize,
    /// Nearest-neighbour, last writer wins, area weighted.
    pub merge: StitchOptions,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            merge: StitchOptions::new()
                .with_resample(ResampleMethod::Nearest)
                .with_overlap(OverlapPolicy::Replace)
                .with_area_weighting(true),
        }
    }
}

impl StitchConfig {
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Capacity of the stitch channel: twice the flush threshold, at least 1.
    pub fn channel_capacity(&self) -> usize {
        (2 * self.flush_threshold).max(1)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Merges per-job rasters into one mosaic.
pub struct StitchWorker {
    output: String,
    mosaic_path: PathBuf,
    store: Arc<dyn RasterStore>,
    cleanup_tx: mpsc::UnboundedSender<CleanupSignal>,
    config: StitchConfig,
    progress: Progress,
    buffer: Vec<StitchItem>,
    report: StitchReport,
}

impl StitchWorker {
    /// Creates a worker for `output`, expecting `expected` messages.
    pub fn new(
        output: impl Into<String>,
        mosaic_path: impl Into<PathBuf>,
        store: Arc<dyn RasterStore>,
        cleanup_tx: mpsc::UnboundedSender<CleanupSignal>,
        config: StitchConfig,
        expected: usize,
    ) -> Self {
        let output = output.into();
        Self {
            report: StitchReport {
                output: output.clone(),
                ..Default::default()
            },
            output,
            mosaic_path: mosaic_path.into(),
            store,
            cleanup_tx,
            config,
            progress: Progress::new(expected),
            buffer: Vec::new(),
        }
    }

    /// Consumes messages until `Close` or until every sender is dropped.
    ///
    /// # Errors
    ///
    /// A failed merge stops the worker. Rasters of the failed flush are not
    /// acknowledged, so their scratch directories are kept.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<StitchMessage>,
    ) -> Result<StitchReport, StitchError> {
        info!(output = %self.output, mosaic = %self.mosaic_path.display(), "Stitch worker started");

        loop {
            let message = match rx.recv().await {
                Some(message) => message,
                None => {
                    debug!(output = %self.output, "Stitch channel closed without Close");
                    StitchMessage::Close
                }
            };

            match message {
                StitchMessage::Item(item) => {
                    let weight = item.weight;
                    self.buffer.push(item);
                    if self.buffer.len() > self.config.flush_threshold {
                        self.flush().await?;
                    }
                    self.record(weight);
                }
                StitchMessage::Skip => self.record(1),
                StitchMessage::Close => {
                    if !self.buffer.is_empty() {
                        self.flush().await?;
                    }
                    break;
                }
            }
        }

        info!(
            output = %self.output,
            processed = self.report.processed,
            merged = self.report.merged,
            flushes = self.report.flushes,
            "Stitch worker finished"
        );
        Ok(self.report)
    }

    fn record(&mut self, units: usize) {
        let snapshot = self.progress.record(units);
        self.report.processed = snapshot.processed;
        info!(
            output = %self.output,
            processed = snapshot.processed,
            expected = snapshot.expected,
            percent = %format!("{:.1}", snapshot.percent()),
            remaining_secs = ?snapshot.remaining.map(|d| d.as_secs()),
            "Stitch progress"
        );
    }

    async fn flush(&mut self) -> Result<(), StitchError> {
        let items = std::mem::take(&mut self.buffer);
        let count = items.len();
        let paths: Vec<PathBuf> = items.iter().map(|i| i.raster_path.clone()).collect();
        let store = Arc::clone(&self.store);
        let mosaic = self.mosaic_path.clone();
        let merge = self.config.merge;

        debug!(output = %self.output, count, "Flushing stitch buffer");
        let result =
            tokio::task::spawn_blocking(move || store.stitch(&paths, &mosaic, &merge)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                error!(output = %self.output, count, error = %source, "Stitch merge failed");
                return Err(StitchError::Merge {
                    output: self.output.clone(),
                    count,
                    source,
                });
            }
            Err(_) => {
                error!(output = %self.output, "Stitch merge task panicked");
                return Err(StitchError::Panicked {
                    output: self.output.clone(),
                });
            }
        }

        for item in items {
            if self
                .cleanup_tx
                .send(CleanupSignal::Ack(item.scratch_dir))
                .is_err()
            {
                warn!(output = %self.output, "Cleanup coordinator gone, acknowledgement dropped");
            }
        }
        self.report.merged += count;
        self.report.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::BoundingBox;
    use crate::raster::{GridRaster, GridStore, MosaicSpec};
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
        mosaic: PathBuf,
        cleanup_rx: mpsc::UnboundedReceiver<CleanupSignal>,
        worker: Option<StitchWorker>,
    }

    fn harness(threshold: usize, expected: usize) -> Harness {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn RasterStore> = Arc::new(GridStore::new());
        let mosaic = temp.path().join("stitched_usle.grid");
        store
            .create_mosaic(
                &mosaic,
                &MosaicSpec::geographic(BoundingBox::new(0.0, 0.0, 8.0, 1.0), 1.0),
            )
            .unwrap();
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let worker = StitchWorker::new(
            "usle",
            mosaic.clone(),
            store,
            cleanup_tx,
            StitchConfig::default().with_flush_threshold(threshold),
            expected,
        );
        Harness {
            temp,
            mosaic,
            cleanup_rx,
            worker: Some(worker),
        }
    }

    /// Writes a 1x1 raster at column `col` into its own job directory.
    fn job_raster(root: &Path, col: usize, value: f32) -> StitchItem {
        let path = root.join(format!("job_{col}_{value}")).join("usle.grid");
        let mut raster = GridRaster::filled(1, 1, [col as f64, 1.0, 0.0, 1.0, 0.0, -1.0], 4326, -9999.0);
        raster.data[0] = value;
        raster.save(&path).unwrap();
        StitchItem::new(path)
    }

    fn drain_acks(rx: &mut mpsc::UnboundedReceiver<CleanupSignal>) -> Vec<PathBuf> {
        let mut acks = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let CleanupSignal::Ack(dir) = signal {
                acks.push(dir);
            }
        }
        acks
    }

    #[tokio::test]
    async fn test_counts_items_and_skips_with_final_flush() {
        let mut h = harness(10, 5);
        let (tx, rx) = mpsc::channel(20);
        let items: Vec<StitchItem> = (0..3).map(|c| job_raster(h.temp.path(), c, c as f32)).collect();
        for item in &items {
            tx.send(StitchMessage::Item(item.clone())).await.unwrap();
        }
        tx.send(StitchMessage::Skip).await.unwrap();
        tx.send(StitchMessage::Skip).await.unwrap();
        tx.send(StitchMessage::Close).await.unwrap();

        let report = h.worker.take().unwrap().run(rx).await.unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.merged, 3);
        assert_eq!(report.flushes, 1);

        let acks = drain_acks(&mut h.cleanup_rx);
        let expected: Vec<PathBuf> = items.iter().map(|i| i.scratch_dir.clone()).collect();
        assert_eq!(acks, expected);

        let mosaic = GridRaster::load(&h.mosaic).unwrap();
        assert_eq!(&mosaic.data[..3], &[0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_flushes_when_threshold_exceeded() {
        let mut h = harness(2, 4);
        let (tx, rx) = mpsc::channel(8);
        for c in 0..4 {
            tx.send(StitchMessage::Item(job_raster(h.temp.path(), c, 1.0)))
                .await
                .unwrap();
        }
        drop(tx);

        let report = h.worker.take().unwrap().run(rx).await.unwrap();
        // flush at 3 buffered, final flush of the remaining one
        assert_eq!(report.flushes, 2);
        assert_eq!(report.merged, 4);
        assert_eq!(drain_acks(&mut h.cleanup_rx).len(), 4);
    }

    #[tokio::test]
    async fn test_later_item_wins_within_flush() {
        let mut h = harness(10, 2);
        let (tx, rx) = mpsc::channel(4);
        tx.send(StitchMessage::Item(job_raster(h.temp.path(), 2, 1.0)))
            .await
            .unwrap();
        tx.send(StitchMessage::Item(job_raster(h.temp.path(), 2, 7.0)))
            .await
            .unwrap();
        tx.send(StitchMessage::Close).await.unwrap();

        h.worker.take().unwrap().run(rx).await.unwrap();
        let mosaic = GridRaster::load(&h.mosaic).unwrap();
        assert_eq!(mosaic.get(2, 0), Some(7.0));
    }

    #[tokio::test]
    async fn test_merge_failure_stops_worker_without_acks() {
        let mut h = harness(10, 1);
        let (tx, rx) = mpsc::channel(4);
        tx.send(StitchMessage::Item(StitchItem::new(h.temp.path().join("missing/usle.grid"))))
            .await
            .unwrap();
        tx.send(StitchMessage::Close).await.unwrap();

        let err = h.worker.take().unwrap().run(rx).await.unwrap_err();
        assert!(matches!(err, StitchError::Merge { count: 1, .. }));
        assert!(drain_acks(&mut h.cleanup_rx).is_empty());
    }

    #[test]
    fn test_item_scratch_dir_defaults_to_parent() {
        let item = StitchItem::new("/work/sdr_workspace/job/usle.grid");
        assert_eq!(item.scratch_dir, PathBuf::from("/work/sdr_workspace/job"));
        let item = item.with_scratch_dir("/work/sdr_workspace");
        assert_eq!(item.scratch_dir, PathBuf::from("/work/sdr_workspace"));
        assert_eq!(item.weight, 1);
    }

    #[test]
    fn test_channel_capacity() {
        assert!(StitchConfig::default().merge.area_weighted);
        assert_eq!(StitchConfig::default().channel_capacity(), 20);
        assert_eq!(StitchConfig::default().with_flush_threshold(0).channel_capacity(), 1);
    }
}
