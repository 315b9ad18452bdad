//! The batch job: align inputs, run the model, hand results to stitchers.
//!
//! For one batch the job:
//!
//! 1. reads the batch's region subset and tests its geographic envelope
//!    against the global extent; a disjoint batch sends `Skip` to every
//!    output and stops
//! 2. aligns every configured raster input in two stages, a clip to the
//!    batch envelope at native resolution in geographic coordinates, then a
//!    resample into the batch projection at the target pixel size, masked by
//!    the batch polygons (existing intermediate files are reused)
//! 3. runs the region model on the blocking pool
//! 4. checks that every declared output exists and sends one `Item` per
//!    output, waiting when a stitch channel is full
//!
//! All file and CPU heavy steps run under `spawn_blocking`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::batch::BatchDescriptor;
use crate::geo::{BoundingBox, GeoError, WGS84_EPSG};
use crate::model::{ModelError, ModelInvocation, ModelKind, RegionModel};
use crate::raster::{RasterError, RasterStore, WarpOptions};
use crate::region::{RegionError, RegionStore, RegionSubset};
use crate::stitch::{StitchItem, StitchMessage};

use super::task::{BatchTask, JobOutcome, TaskFuture};

/// Directory inside a job workspace holding aligned inputs.
pub const DATA_DIR: &str = "data";

/// Prefix of first-stage (clipped) intermediate rasters.
const CLIP_PREFIX: &str = "clip_";

// =============================================================================
// Errors
// =============================================================================

/// Errors that fail a single batch.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Projection(#[from] GeoError),

    #[error("required input {input} is not configured")]
    MissingInput { input: String },

    #[error("subset {0} has no regions")]
    EmptySubset(PathBuf),

    #[error("job {job_id} did not produce {path}")]
    MissingOutput { job_id: String, path: PathBuf },

    #[error("stitch channel for {} is closed", outputs.join(", "))]
    ChannelClosed { outputs: Vec<String> },

    #[error("job {job_id} panicked")]
    Panicked { job_id: String },
}

// =============================================================================
// Context
// =============================================================================

/// One declared output and the channel of its stitch worker.
#[derive(Debug, Clone)]
pub struct OutputTarget {
    /// Output name, used in logs.
    pub name: String,
    /// Output path relative to a job workspace.
    pub local_path: PathBuf,
    pub sender: mpsc::Sender<StitchMessage>,
}

/// Everything a batch job needs, shared by every batch of a model run.
pub struct JobContext {
    pub kind: ModelKind,
    pub rasters: Arc<dyn RasterStore>,
    pub regions: Arc<dyn RegionStore>,
    pub model: Arc<dyn RegionModel>,
    /// Intersection of every input extent, geographic.
    pub global_bbox: BoundingBox,
    /// Input name to source raster.
    pub inputs: BTreeMap<String, PathBuf>,
    pub params: BTreeMap<String, String>,
    /// Pixel size of aligned inputs, in batch projection units.
    pub target_pixel_size: f64,
    /// Parent of every job workspace.
    pub workspace_root: PathBuf,
    pub result_suffix: Option<String>,
    pub outputs: Vec<OutputTarget>,
}

// =============================================================================
// Batch job
// =============================================================================

/// Production [`BatchTask`].
pub struct BatchJob {
    ctx: JobContext,
}

impl BatchJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Job workspace of a batch: named after its subset file.
    pub fn job_dir(&self, batch: &BatchDescriptor) -> PathBuf {
        let stem = batch
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| batch.job_id.clone());
        self.ctx.workspace_root.join(stem)
    }

    async fn run(&self, batch: &BatchDescriptor) -> Result<JobOutcome, JobError> {
        let regions = Arc::clone(&self.ctx.regions);
        let subset_path = batch.path.clone();
        let subset = blocking(&batch.job_id, move || {
            regions.read_subset(&subset_path).map_err(JobError::from)
        })
        .await?;

        let geographic = subset.geographic_envelope()?;
        let overlaps = geographic.is_some_and(|bb| bb.intersects(&self.ctx.global_bbox));
        let Some(geographic) = geographic.filter(|_| overlaps) else {
            debug!(
                job_id = %batch.job_id,
                global = %self.ctx.global_bbox,
                "Batch outside global extent, skipping"
            );
            self.emit(|_| StitchMessage::Skip).await?;
            return Ok(JobOutcome::Skipped);
        };

        let job_dir = self.job_dir(batch);
        let subset = Arc::new(subset);
        let single_outlet = subset.regions.len() == 1;
        let epsg = subset.epsg;

        let aligned = {
            let rasters = Arc::clone(&self.ctx.rasters);
            let inputs = self.ctx.inputs.clone();
            let kind = self.ctx.kind;
            let pixel_size = self.ctx.target_pixel_size;
            let data_dir = job_dir.join(DATA_DIR);
            let subset_path = batch.path.clone();
            blocking(&batch.job_id, move || {
                align_inputs(
                    rasters.as_ref(),
                    kind,
                    &inputs,
                    &subset,
                    &subset_path,
                    geographic,
                    pixel_size,
                    &data_dir,
                )
            })
            .await?
        };

        let invocation = ModelInvocation {
            kind: self.ctx.kind,
            job_id: batch.job_id.clone(),
            workspace_dir: job_dir.clone(),
            inputs: aligned,
            subset_path: batch.path.clone(),
            single_outlet,
            target_pixel_size: self.ctx.target_pixel_size,
            epsg,
            params: self.ctx.params.clone(),
            result_suffix: self.ctx.result_suffix.clone(),
        };
        let model = Arc::clone(&self.ctx.model);
        blocking(&batch.job_id, move || {
            model.run(&invocation).map_err(JobError::from)
        })
        .await?;

        for target in &self.ctx.outputs {
            let path = job_dir.join(&target.local_path);
            if !path.exists() {
                return Err(JobError::MissingOutput {
                    job_id: batch.job_id.clone(),
                    path,
                });
            }
        }

        self.emit(|target| {
            StitchMessage::Item(
                StitchItem::new(job_dir.join(&target.local_path)).with_scratch_dir(&job_dir),
            )
        })
        .await?;
        info!(job_id = %batch.job_id, area = batch.area, "Batch emitted");
        Ok(JobOutcome::Emitted)
    }

    /// Sends one message per output, in declaration order.
    ///
    /// A closed channel does not stop the remaining outputs from receiving
    /// their message; the closed outputs are reported once all were tried.
    async fn emit<F>(&self, message: F) -> Result<(), JobError>
    where
        F: Fn(&OutputTarget) -> StitchMessage,
    {
        let mut closed = Vec::new();
        for target in &self.ctx.outputs {
            if target.sender.send(message(target)).await.is_err() {
                warn!(output = %target.name, "Stitch worker gone, output not fed");
                closed.push(target.name.clone());
            }
        }
        if closed.is_empty() {
            Ok(())
        } else {
            Err(JobError::ChannelClosed { outputs: closed })
        }
    }
}

impl BatchTask for BatchJob {
    fn name(&self) -> &str {
        self.ctx.kind.name()
    }

    fn execute<'a>(&'a self, batch: &'a BatchDescriptor) -> TaskFuture<'a> {
        Box::pin(self.run(batch))
    }
}

/// Runs a blocking step on the blocking pool.
async fn blocking<T, F>(job_id: &str, f: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| JobError::Panicked {
            job_id: job_id.to_string(),
        })?
}

/// Aligns every configured input of `kind` onto the batch grid.
///
/// Returns input name to the path handed to the model: aligned rasters for
/// resampled inputs, the source path for pass-through inputs.
#[allow(clippy::too_many_arguments)]
fn align_inputs(
    rasters: &dyn RasterStore,
    kind: ModelKind,
    inputs: &BTreeMap<String, PathBuf>,
    subset: &Arc<RegionSubset>,
    subset_path: &Path,
    geographic: BoundingBox,
    pixel_size: f64,
    data_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, JobError> {
    let projected = subset
        .envelope()
        .ok_or_else(|| JobError::EmptySubset(subset_path.to_path_buf()))?;
    let mut aligned = BTreeMap::new();

    for input in kind.inputs() {
        let Some(src) = inputs.get(input.name) else {
            if input.required {
                return Err(JobError::MissingInput {
                    input: input.name.to_string(),
                });
            }
            continue;
        };
        let Some(method) = input.resample else {
            aligned.insert(input.name.to_string(), src.clone());
            continue;
        };

        let file_name = format!(
            "{}_{}",
            input.name,
            src.file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let target = data_dir.join(&file_name);
        if target.exists() {
            debug!(input = input.name, path = %target.display(), "Reusing aligned input");
            aligned.insert(input.name.to_string(), target);
            continue;
        }

        let clipped = data_dir.join(format!("{}{}", CLIP_PREFIX, file_name));
        if !clipped.exists() {
            let info = rasters.info(src)?;
            let mut options = WarpOptions::new()
                .with_target_epsg(WGS84_EPSG)
                .with_bounds(geographic)
                .with_resample(method);
            if info.epsg == WGS84_EPSG {
                let (px, py) = info.pixel_size();
                options = options.with_pixel_size(px, py);
            } else {
                warn!(input = input.name, epsg = info.epsg, "Input is not geographic, deriving clip resolution");
            }
            rasters.warp(src, &clipped, &options)?;
        }

        let options = WarpOptions::new()
            .with_target_epsg(subset.epsg)
            .with_bounds(projected)
            .with_pixel_size(pixel_size, pixel_size)
            .with_resample(method)
            .with_mask(Arc::clone(subset));
        rasters.warp(&clipped, &target, &options)?;
        aligned.insert(input.name.to_string(), target);
    }

    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Projection;
    use crate::model::{default_output_path, with_suffix};
    use crate::raster::{GridRaster, GridStore};
    use crate::region::{Geometry, JsonRegionStore, Region};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Records invocations and writes a 1x1 raster per output.
    #[derive(Default)]
    struct RecordingModel {
        calls: AtomicUsize,
        seen: Mutex<Vec<ModelInvocation>>,
        skip_outputs: bool,
    }

    impl RegionModel for RecordingModel {
        fn run(&self, invocation: &ModelInvocation) -> Result<(), ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(invocation.clone());
            if self.skip_outputs {
                return Ok(());
            }
            for map in invocation.kind.default_outputs() {
                let local = with_suffix(&default_output_path(map), invocation.result_suffix.as_deref());
                let raster = GridRaster::filled(1, 1, [14.0, 1.0, 0.0, 46.0, 0.0, -1.0], 4326, -9999.0);
                raster
                    .save(&invocation.workspace_dir.join(local))
                    .map_err(|e| ModelError::Other(e.to_string()))?;
            }
            Ok(())
        }
    }

    struct Fixture {
        temp: TempDir,
        batch: BatchDescriptor,
        inputs: BTreeMap<String, PathBuf>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let region = Region::new("c", 1, Geometry::rectangle(14.2, 45.2, 14.4, 45.4)).unwrap();
        let utm = Projection::from_epsg(region.zone_epsg).unwrap();
        let subset = RegionSubset {
            job_id: "c_1".to_string(),
            epsg: region.zone_epsg,
            regions: vec![region.reprojected(Projection::Geographic, utm)],
        };
        let path = temp.path().join("watershed_subsets").join("c_1_a0.040.json");
        JsonRegionStore::new().write_subset(&subset, &path).unwrap();

        let mut inputs = BTreeMap::new();
        for name in ["dem", "runoff_proxy", "lulc"] {
            let src = temp.path().join("inputs").join(format!("{name}.grid"));
            let mut raster = GridRaster::filled(100, 100, [14.0, 0.01, 0.0, 46.0, 0.0, -0.01], 4326, -9999.0);
            raster.data.iter_mut().for_each(|v| *v = 3.0);
            raster.save(&src).unwrap();
            inputs.insert(name.to_string(), src);
        }

        Fixture {
            batch: BatchDescriptor {
                job_id: "c_1".to_string(),
                area: 0.04,
                path,
            },
            temp,
            inputs,
        }
    }

    fn build_job(
        fixture: &Fixture,
        model: Arc<RecordingModel>,
        global_bbox: BoundingBox,
    ) -> (BatchJob, Vec<mpsc::Receiver<StitchMessage>>) {
        let mut outputs = Vec::new();
        let mut receivers = Vec::new();
        for map in ModelKind::Ndr.default_outputs() {
            let (tx, rx) = mpsc::channel(4);
            outputs.push(OutputTarget {
                name: map.to_string(),
                local_path: default_output_path(map),
                sender: tx,
            });
            receivers.push(rx);
        }
        let ctx = JobContext {
            kind: ModelKind::Ndr,
            rasters: Arc::new(GridStore::new()),
            regions: Arc::new(JsonRegionStore::new()),
            model,
            global_bbox,
            inputs: fixture.inputs.clone(),
            params: BTreeMap::new(),
            target_pixel_size: 500.0,
            workspace_root: fixture.temp.path().join("ndr_workspace"),
            result_suffix: None,
            outputs,
        };
        (BatchJob::new(ctx), receivers)
    }

    #[tokio::test]
    async fn test_disjoint_batch_skips_without_model_call() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, mut receivers) = build_job(&fixture, model.clone(), BoundingBox::new(-80.0, 0.0, -70.0, 10.0));

        let outcome = job.execute(&fixture.batch).await.unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), StitchMessage::Skip);
        }
        assert!(!job.job_dir(&fixture.batch).exists());
    }

    #[tokio::test]
    async fn test_emits_item_per_output() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, mut receivers) = build_job(&fixture, model.clone(), BoundingBox::new(0.0, 0.0, 20.0, 50.0));

        let outcome = job.execute(&fixture.batch).await.unwrap();
        assert!(outcome.is_emitted());

        let job_dir = fixture.temp.path().join("ndr_workspace").join("c_1_a0.040");
        let seen = model.seen.lock();
        assert_eq!(seen.len(), 1);
        let invocation = &seen[0];
        assert!(invocation.single_outlet);
        assert_eq!(invocation.epsg, 32633);
        assert_eq!(invocation.workspace_dir, job_dir);
        assert_eq!(invocation.inputs.len(), 3);
        for path in invocation.inputs.values() {
            assert!(path.starts_with(job_dir.join(DATA_DIR)));
            assert!(path.exists());
        }

        for (rx, map) in receivers.iter_mut().zip(ModelKind::Ndr.default_outputs()) {
            match rx.try_recv().unwrap() {
                StitchMessage::Item(item) => {
                    assert_eq!(item.raster_path, job_dir.join(default_output_path(map)));
                    // outputs in sub-directories still acknowledge the job workspace
                    assert_eq!(item.scratch_dir, job_dir);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_reuses_aligned_inputs() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, _receivers) = build_job(&fixture, model.clone(), BoundingBox::new(0.0, 0.0, 20.0, 50.0));
        job.execute(&fixture.batch).await.unwrap();

        // removing the sources proves the second run never reads them
        std::fs::remove_dir_all(fixture.temp.path().join("inputs")).unwrap();
        let (job, _receivers) = build_job(&fixture, model.clone(), BoundingBox::new(0.0, 0.0, 20.0, 50.0));
        assert!(job.execute(&fixture.batch).await.unwrap().is_emitted());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_output_fails_without_emitting() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel {
            skip_outputs: true,
            ..Default::default()
        });
        let (job, mut receivers) = build_job(&fixture, model, BoundingBox::new(0.0, 0.0, 20.0, 50.0));

        let err = job.execute(&fixture.batch).await.unwrap_err();
        assert!(matches!(err, JobError::MissingOutput { .. }));
        for rx in &mut receivers {
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_missing_required_input() {
        let mut fixture = fixture();
        fixture.inputs.remove("runoff_proxy");
        let model = Arc::new(RecordingModel::default());
        let (job, _receivers) = build_job(&fixture, model.clone(), BoundingBox::new(0.0, 0.0, 20.0, 50.0));

        let err = job.execute(&fixture.batch).await.unwrap_err();
        assert!(matches!(err, JobError::MissingInput { input } if input == "runoff_proxy"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_job() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, receivers) = build_job(&fixture, model, BoundingBox::new(-80.0, 0.0, -70.0, 10.0));
        drop(receivers);

        let err = job.execute(&fixture.batch).await.unwrap_err();
        assert!(matches!(err, JobError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_closed_output_does_not_starve_siblings() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, mut receivers) = build_job(&fixture, model, BoundingBox::new(0.0, 0.0, 20.0, 50.0));
        drop(receivers.remove(0));

        let err = job.execute(&fixture.batch).await.unwrap_err();
        match err {
            JobError::ChannelClosed { outputs } => assert_eq!(outputs, vec!["n_export".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
        for rx in &mut receivers {
            assert!(matches!(rx.try_recv().unwrap(), StitchMessage::Item(_)));
        }
    }

    #[tokio::test]
    async fn test_closed_output_still_skips_siblings() {
        let fixture = fixture();
        let model = Arc::new(RecordingModel::default());
        let (job, mut receivers) = build_job(&fixture, model, BoundingBox::new(-80.0, 0.0, -70.0, 10.0));
        drop(receivers.remove(1));

        let err = job.execute(&fixture.batch).await.unwrap_err();
        assert_eq!(err.to_string(), "stitch channel for n_retention is closed");
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), StitchMessage::Skip);
        }
    }
}
