//! Model run orchestration.
//!
//! [`Pipeline::run_model`] wires one model run together:
//!
//! 1. intersect the extents of every aligned input into the global bounding
//!    box
//! 2. create each output mosaic that does not exist yet
//! 3. start the cleanup coordinator and one stitch worker per output
//! 4. run every batch through the scheduler
//! 5. shut down in order: `Close` to every stitch channel, join the stitch
//!    workers, `Close` to the cleanup channel, join the coordinator
//!
//! Failures of single batches or stitch workers do not stop the run; they are
//! collected and reported as [`PipelineError::RunFailed`] once everything has
//! been joined.
//!
//! # Example
//!
//! ```ignore
//! use watershed_mosaic::pipeline::{ModelRun, Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(config, Arc::new(GridStore::new()), Arc::new(JsonRegionStore::new()));
//! let plan = pipeline.run_batching(&batcher, &watersheds_dir)?;
//! let report = pipeline.run_model(&ModelRun::new(ModelKind::Sdr), model, &plan.batches).await?;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::batch::{BatchDescriptor, BatchManifest, BatchPlan, BatchingError, RegionBatcher};
use crate::cleanup::{CleanupCoordinator, CleanupReport, CleanupSignal};
use crate::executor::{
    default_workers, BatchJob, JobContext, JobScheduler, OutputTarget, ScheduleReport,
    SchedulerConfig,
};
use crate::geo::{self, transform_bounding_box, BoundingBox, GeoError, Projection};
use crate::model::{default_output_path, with_suffix, ModelKind, RegionModel};
use crate::raster::{MosaicSpec, RasterError, RasterStore};
use crate::region::RegionStore;
use crate::stitch::{
    StitchConfig, StitchMessage, StitchReport, StitchWorker, DEFAULT_FLUSH_THRESHOLD,
};

/// Directory inside the workspace holding region subsets.
pub const SUBSET_DIR: &str = "watershed_subsets";

/// Prefix of default mosaic file names.
pub const MOSAIC_PREFIX: &str = "stitched_";

/// Default global mosaic pixel size: 10 arc-seconds.
pub const DEFAULT_GLOBAL_PIXEL_SIZE_DEG: f64 = 0.002_777_777_8;

/// Default target pixel size of aligned inputs, in metres.
pub const DEFAULT_TARGET_PIXEL_SIZE_M: f64 = 90.0;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} model run has no aligned inputs")]
    NoInputs(ModelKind),

    #[error("{0} model run declares no outputs")]
    NoOutputs(ModelKind),

    #[error("input extents do not overlap: {0}")]
    GlobalExtent(#[from] GeoError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Batching(#[from] BatchingError),

    #[error("{kind} run failed: {failed_jobs} batch(es) failed, {failed_outputs} output(s) failed")]
    RunFailed {
        kind: ModelKind,
        failed_jobs: usize,
        failed_outputs: usize,
        report: Box<PipelineReport>,
    },

    #[error("background task panicked: {0}")]
    Panicked(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Scenario-wide run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub workspace_dir: PathBuf,
    /// Appended to local output names and mosaic names.
    pub result_suffix: Option<String>,
    /// Keep job workspaces after stitching.
    pub keep_intermediate: bool,
    pub global_pixel_size_deg: f64,
    pub target_pixel_size_m: f64,
    pub workers: usize,
    pub flush_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            result_suffix: None,
            keep_intermediate: false,
            global_pixel_size_deg: DEFAULT_GLOBAL_PIXEL_SIZE_DEG,
            target_pixel_size_m: DEFAULT_TARGET_PIXEL_SIZE_M,
            workers: default_workers(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_result_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.result_suffix = Some(suffix.into());
        self
    }

    pub fn with_keep_intermediate(mut self, keep: bool) -> Self {
        self.keep_intermediate = keep;
        self
    }

    pub fn with_global_pixel_size(mut self, degrees: f64) -> Self {
        self.global_pixel_size_deg = degrees;
        self
    }

    pub fn with_target_pixel_size(mut self, metres: f64) -> Self {
        self.target_pixel_size_m = metres;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn subset_dir(&self) -> PathBuf {
        self.workspace_dir.join(SUBSET_DIR)
    }

    /// Resolves a mosaic path against the workspace.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_dir.join(path)
        }
    }
}

/// One declared output: where the model writes it and where it is stitched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Path relative to a job workspace, without result suffix.
    pub local: PathBuf,
    /// Mosaic path, without result suffix; relative paths resolve against
    /// the workspace.
    pub mosaic: PathBuf,
}

impl OutputSpec {
    pub fn new(local: impl Into<PathBuf>, mosaic: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            mosaic: mosaic.into(),
        }
    }

    /// Output with the default mosaic name `stitched_{file name}`.
    pub fn with_default_mosaic(local: impl Into<PathBuf>) -> Self {
        let local = local.into();
        let file_name = local
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mosaic = PathBuf::from(format!("{}{}", MOSAIC_PREFIX, file_name));
        Self { local, mosaic }
    }

    /// Short name for logs: the local file stem.
    pub fn name(&self) -> String {
        self.local
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One model kind's inputs, outputs and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRun {
    pub kind: ModelKind,
    /// Input name to source raster.
    pub inputs: BTreeMap<String, PathBuf>,
    pub outputs: Vec<OutputSpec>,
    pub params: BTreeMap<String, String>,
}

impl ModelRun {
    /// Run with the kind's default outputs and no inputs yet.
    pub fn new(kind: ModelKind) -> Self {
        Self {
            kind,
            inputs: BTreeMap::new(),
            outputs: kind
                .default_outputs()
                .iter()
                .map(|map| OutputSpec::with_default_mosaic(default_output_path(map)))
                .collect(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(name.into(), path.into());
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Inputs that get aligned (and so bound the global extent).
    pub fn aligned_inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter().filter_map(|(name, path)| {
            self.kind
                .input(name)
                .filter(|input| input.resample.is_some())
                .map(|_| path)
        })
    }
}

// =============================================================================
// Report
// =============================================================================

/// Everything that happened during one model run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub schedule: ScheduleReport,
    pub stitch: Vec<StitchReport>,
    /// Outputs whose stitch worker failed, with the error text.
    pub stitch_failures: Vec<(String, String)>,
    pub cleanup: CleanupReport,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs batching and model runs for one scenario.
pub struct Pipeline {
    config: PipelineConfig,
    rasters: Arc<dyn RasterStore>,
    regions: Arc<dyn RegionStore>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        rasters: Arc<dyn RasterStore>,
        regions: Arc<dyn RegionStore>,
    ) -> Self {
        Self {
            config,
            rasters,
            regions,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Batches `watersheds_dir` into the workspace's subset directory.
    ///
    /// The manifest name carries the batcher's minimum area, so a rerun with
    /// the same threshold reuses the stored plan.
    pub fn run_batching<S: RegionStore>(
        &self,
        batcher: &RegionBatcher<S>,
        watersheds_dir: &Path,
    ) -> Result<BatchPlan, BatchingError> {
        let manifest = BatchManifest::path_for(&self.config.workspace_dir, batcher.config().min_area);
        batcher.run(watersheds_dir, &self.config.subset_dir(), &manifest)
    }

    /// Runs one model over every batch and stitches the results.
    ///
    /// # Errors
    ///
    /// Setup failures (no inputs, disjoint input extents, mosaic creation)
    /// return before any batch runs. Batch and stitch failures are reported
    /// as [`PipelineError::RunFailed`] after the run has shut down cleanly.
    pub async fn run_model(
        &self,
        run: &ModelRun,
        model: Arc<dyn RegionModel>,
        batches: &[BatchDescriptor],
    ) -> Result<PipelineReport, PipelineError> {
        let kind = run.kind;
        if run.outputs.is_empty() {
            return Err(PipelineError::NoOutputs(kind));
        }
        let global_bbox = self.global_bounding_box(run).await?;
        info!(%kind, global = %global_bbox, batches = batches.len(), "Starting model run");

        let suffix = self.config.result_suffix.as_deref();
        let outputs: Vec<(OutputSpec, PathBuf)> = run
            .outputs
            .iter()
            .map(|spec| {
                let local = with_suffix(&spec.local, suffix);
                let mosaic = self.config.resolve(&with_suffix(&spec.mosaic, suffix));
                (OutputSpec::new(local, spec.mosaic.clone()), mosaic)
            })
            .collect();
        for (_, mosaic) in &outputs {
            self.ensure_mosaic(mosaic, global_bbox).await?;
        }

        // cleanup coordinator
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let cleanup = tokio::spawn(
            CleanupCoordinator::new(outputs.len(), self.config.keep_intermediate).run(cleanup_rx),
        );

        // one stitch worker per output
        let stitch_config = StitchConfig::default().with_flush_threshold(self.config.flush_threshold);
        let mut stitch_senders = Vec::with_capacity(outputs.len());
        let mut stitch_handles = Vec::with_capacity(outputs.len());
        let mut targets = Vec::with_capacity(outputs.len());
        for (spec, mosaic) in &outputs {
            let (tx, rx) = mpsc::channel(stitch_config.channel_capacity());
            let worker = StitchWorker::new(
                spec.name(),
                mosaic.clone(),
                Arc::clone(&self.rasters),
                cleanup_tx.clone(),
                stitch_config,
                batches.len(),
            );
            stitch_handles.push((spec.name(), tokio::spawn(worker.run(rx))));
            targets.push(OutputTarget {
                name: spec.name(),
                local_path: spec.local.clone(),
                sender: tx.clone(),
            });
            stitch_senders.push(tx);
        }

        let job = Arc::new(BatchJob::new(JobContext {
            kind,
            rasters: Arc::clone(&self.rasters),
            regions: Arc::clone(&self.regions),
            model,
            global_bbox,
            inputs: run.inputs.clone(),
            params: run.params.clone(),
            target_pixel_size: self.config.target_pixel_size_m,
            workspace_root: self.config.workspace_dir.join(kind.workspace_dir_name()),
            result_suffix: self.config.result_suffix.clone(),
            outputs: targets,
        }));

        let scheduler = JobScheduler::new(SchedulerConfig::default().with_workers(self.config.workers));
        let schedule = scheduler.run(batches.to_vec(), job).await;

        // ordered shutdown: stitchers first, then cleanup
        for tx in stitch_senders {
            if tx.send(StitchMessage::Close).await.is_err() {
                warn!(%kind, "Stitch worker already stopped before Close");
            }
        }
        let mut report = PipelineReport {
            schedule,
            ..Default::default()
        };
        for (name, handle) in stitch_handles {
            match handle.await {
                Ok(Ok(stitch)) => report.stitch.push(stitch),
                Ok(Err(e)) => {
                    error!(%kind, output = %name, error = %e, "Stitch worker failed");
                    report.stitch_failures.push((name, e.to_string()));
                }
                Err(e) => {
                    error!(%kind, output = %name, error = %e, "Stitch worker panicked");
                    report.stitch_failures.push((name, e.to_string()));
                }
            }
        }

        if cleanup_tx.send(CleanupSignal::Close).is_err() {
            warn!(%kind, "Cleanup coordinator already stopped before Close");
        }
        drop(cleanup_tx);
        report.cleanup = cleanup
            .await
            .map_err(|e| PipelineError::Panicked(e.to_string()))?;

        let failed_jobs = report.schedule.failed() + report.schedule.panicked_workers;
        let failed_outputs = report.stitch_failures.len();
        info!(
            %kind,
            emitted = report.schedule.emitted(),
            skipped = report.schedule.skipped(),
            failed_jobs,
            failed_outputs,
            deleted = report.cleanup.deleted,
            "Model run finished"
        );
        if failed_jobs > 0 || failed_outputs > 0 {
            return Err(PipelineError::RunFailed {
                kind,
                failed_jobs,
                failed_outputs,
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Intersection of every aligned input's extent, in geographic
    /// coordinates.
    pub async fn global_bounding_box(&self, run: &ModelRun) -> Result<BoundingBox, PipelineError> {
        let paths: Vec<PathBuf> = run.aligned_inputs().cloned().collect();
        if paths.is_empty() {
            return Err(PipelineError::NoInputs(run.kind));
        }
        let rasters = Arc::clone(&self.rasters);
        tokio::task::spawn_blocking(move || -> Result<BoundingBox, PipelineError> {
            let mut boxes = Vec::with_capacity(paths.len());
            for path in &paths {
                let info = rasters.info(path)?;
                let projection = Projection::from_epsg(info.epsg).map_err(RasterError::from)?;
                boxes.push(transform_bounding_box(
                    &info.bounds(),
                    projection,
                    Projection::Geographic,
                ));
            }
            Ok(geo::intersect_all(&boxes)?)
        })
        .await
        .map_err(|e| PipelineError::Panicked(e.to_string()))?
    }

    async fn ensure_mosaic(&self, path: &Path, bounds: BoundingBox) -> Result<(), PipelineError> {
        if path.exists() {
            info!(mosaic = %path.display(), "Mosaic present, stitching into it");
            return Ok(());
        }
        info!(mosaic = %path.display(), "Creating mosaic");
        let spec = MosaicSpec::geographic(bounds, self.config.global_pixel_size_deg);
        let rasters = Arc::clone(&self.rasters);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || rasters.create_mosaic(&path, &spec))
            .await
            .map_err(|e| PipelineError::Panicked(e.to_string()))??;
        Ok(())
    }
}
