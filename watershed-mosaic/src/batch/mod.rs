//! Region batching.
//!
//! The [`RegionBatcher`] partitions the regions of every collection in a
//! watershed directory into job batches:
//!
//! - large regions (over one square degree) and explicitly selected regions
//!   each become a singleton batch keyed `{collection}_{id}`
//! - every other region is bucketed by its centroid into a grid cell and its
//!   projection zone, keyed `{collection}_{x}_{y}_{subindex}_{epsg}`
//! - a cell batch never grows past [`MAX_BATCH_REGIONS`]; an overflow counter
//!   opens a sibling batch with the next sub-index
//!
//! Each kept batch is written as a region subset in its projection zone and
//! described by a [`BatchDescriptor`]. The full plan is persisted as a
//! [`BatchManifest`], which also marks the run complete.
//!
//! # Example
//!
//! ```ignore
//! use watershed_mosaic::batch::{BatchConfig, RegionBatcher};
//! use watershed_mosaic::region::JsonRegionStore;
//!
//! let batcher = RegionBatcher::new(JsonRegionStore::new(), BatchConfig::default());
//! let plan = batcher.run(&watersheds_dir, &subset_dir, &manifest_path)?;
//! for batch in &plan.batches {
//!     println!("{} {:.3}", batch.job_id, batch.area);
//! }
//! ```

mod manifest;

pub use manifest::{BatchManifest, MANIFEST_PREFIX};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::geo::{BoundingBox, GeoError, Projection};
use crate::region::{
    Region, RegionCollection, RegionError, RegionId, RegionStore, RegionSubset, SUBSET_EXTENSION,
};

// =============================================================================
// Constants
// =============================================================================

/// Hard upper bound on the number of regions in one batch.
pub const MAX_BATCH_REGIONS: usize = 1000;

/// Regions larger than this (square degrees) are batched on their own.
pub const SINGLETON_AREA: f64 = 1.0;

/// Batches with fewer members than this are subject to the minimum area.
pub const MIN_BATCH_MEMBERS: usize = 3;

/// Default grid cell size in degrees.
pub const DEFAULT_CELL_SIZE_DEG: f64 = 4.0;

// =============================================================================
// Errors
// =============================================================================

/// Errors that abort a batching run.
#[derive(Debug, Error)]
pub enum BatchingError {
    #[error("duplicate job id {0}")]
    DuplicateJobId(String),

    #[error("grid cell size must be positive, got {0}")]
    InvalidCellSize(f64),

    #[error("batch manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Projection(#[from] GeoError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Explicit region selection: collection name to region ids.
pub type ExplicitSubset = BTreeMap<String, Vec<RegionId>>;

/// Batching parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Grid cell size in degrees.
    pub cell_size_deg: f64,
    /// Minimum accumulated area for batches with few members.
    pub min_area: f64,
    /// Regions whose envelope is not fully inside this box are dropped.
    pub filter_bbox: Option<BoundingBox>,
    /// When set, only these collections and ids are visited.
    pub subset: Option<ExplicitSubset>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            cell_size_deg: DEFAULT_CELL_SIZE_DEG,
            min_area: 0.0,
            filter_bbox: None,
            subset: None,
        }
    }
}

impl BatchConfig {
    pub fn with_cell_size(mut self, degrees: f64) -> Self {
        self.cell_size_deg = degrees;
        self
    }

    pub fn with_min_area(mut self, min_area: f64) -> Self {
        self.min_area = min_area;
        self
    }

    pub fn with_filter_bbox(mut self, bbox: BoundingBox) -> Self {
        self.filter_bbox = Some(bbox);
        self
    }

    pub fn with_subset(mut self, subset: ExplicitSubset) -> Self {
        self.subset = Some(subset);
        self
    }
}

// =============================================================================
// Batch types
// =============================================================================

/// A batch under construction, and once emitted, the unit of model work.
#[derive(Debug, Clone, PartialEq)]
pub struct JobBatch {
    pub job_id: String,
    pub collection: String,
    /// Target projection of the batch.
    pub epsg: u32,
    pub region_ids: Vec<RegionId>,
    /// Envelopes of the accepted members, in geographic coordinates.
    pub envelopes: Vec<BoundingBox>,
    /// Accumulated area of the accepted members (square degrees).
    pub area: f64,
}

impl JobBatch {
    fn new(job_id: String, collection: &str, epsg: u32) -> Self {
        Self {
            job_id,
            collection: collection.to_string(),
            epsg,
            region_ids: Vec::new(),
            envelopes: Vec::new(),
            area: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.region_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region_ids.is_empty()
    }

    /// Few-member batches below the minimum area are not worth a model run.
    fn is_too_small(&self, min_area: f64) -> bool {
        self.envelopes.len() < MIN_BATCH_MEMBERS && self.area < min_area
    }

    /// Subset file name: `{job_id}_a{area:.3}.json`.
    pub fn subset_file_name(&self) -> String {
        format!("{}_a{:.3}.{}", self.job_id, self.area, SUBSET_EXTENSION)
    }
}

/// Output element of the batcher: one materialized batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub job_id: String,
    pub area: f64,
    /// Path of the region subset file.
    pub path: PathBuf,
}

/// Why a region ended up in no batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// The region envelope is not fully inside the filter box.
    CrossesFilter,
    /// The region's batch fell below the minimum area.
    BatchTooSmall,
    /// An explicitly selected id does not exist in its collection.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRegion {
    pub collection: String,
    pub id: RegionId,
    pub reason: DropReason,
}

/// Result of a batching run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Batches sorted by area descending, ties by path descending.
    pub batches: Vec<BatchDescriptor>,
    pub dropped: Vec<DroppedRegion>,
}

/// Batches and drops of one collection before materialization.
#[derive(Debug, Default)]
pub struct Partition {
    /// Kept batches, sorted by area descending.
    pub batches: Vec<JobBatch>,
    pub dropped: Vec<DroppedRegion>,
}

// =============================================================================
// Batcher
// =============================================================================

/// Partitions region collections into job batches.
pub struct RegionBatcher<S: RegionStore> {
    store: S,
    config: BatchConfig,
}

impl<S: RegionStore> RegionBatcher<S> {
    pub fn new(store: S, config: BatchConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Batches every collection in `watersheds_dir`.
    ///
    /// Subsets are written into `subset_dir`; existing subset files are kept
    /// as they are. When `manifest_path` already exists the stored plan is
    /// returned and nothing is written.
    ///
    /// # Errors
    ///
    /// Fails on unreadable collections, unwritable subsets, a repeated job id
    /// or an invalid cell size. No manifest is written on failure.
    pub fn run(
        &self,
        watersheds_dir: &Path,
        subset_dir: &Path,
        manifest_path: &Path,
    ) -> Result<BatchPlan, BatchingError> {
        if manifest_path.exists() {
            let manifest = BatchManifest::load(manifest_path)?;
            info!(
                manifest = %manifest_path.display(),
                completed_at = %manifest.completed_at,
                batches = manifest.plan.batches.len(),
                "Batch manifest present, reusing plan"
            );
            return Ok(manifest.plan);
        }
        if self.config.cell_size_deg.is_nan() || self.config.cell_size_deg <= 0.0 {
            return Err(BatchingError::InvalidCellSize(self.config.cell_size_deg));
        }

        let mut plan = BatchPlan::default();
        let mut job_ids = HashSet::new();

        for path in self.store.list_collections(watersheds_dir)? {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(subset) = &self.config.subset {
                if !subset.contains_key(&name) {
                    debug!(collection = %name, "Collection not in explicit subset, skipping");
                    continue;
                }
            }

            info!(collection = %name, "Batching collection");
            let collection = self.store.read_collection(&path)?;
            let partition = self.partition(&collection);
            plan.dropped.extend(partition.dropped);

            for batch in partition.batches {
                if !job_ids.insert(batch.job_id.clone()) {
                    return Err(BatchingError::DuplicateJobId(batch.job_id));
                }
                let descriptor = self.materialize(&collection, &batch, subset_dir)?;
                plan.batches.push(descriptor);
            }
        }

        plan.batches.sort_by(|a, b| {
            b.area
                .total_cmp(&a.area)
                .then_with(|| b.path.cmp(&a.path))
        });

        BatchManifest::new(plan.clone()).save(manifest_path)?;
        info!(
            batches = plan.batches.len(),
            dropped = plan.dropped.len(),
            manifest = %manifest_path.display(),
            "Batching complete"
        );
        Ok(plan)
    }

    /// Assigns the regions of one collection to batches.
    ///
    /// Pure in-memory step: the returned batches are sorted by area descending
    /// and already exclude too-small and empty batches.
    pub fn partition(&self, collection: &RegionCollection) -> Partition {
        let mut partition = Partition::default();
        let mut batches: Vec<JobBatch> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut overflow: HashMap<String, usize> = HashMap::new();

        let selected = self
            .config
            .subset
            .as_ref()
            .and_then(|s| s.get(&collection.name));

        let visits: Vec<(&Region, bool)> = match selected {
            Some(ids) => {
                let mut seen = HashSet::new();
                let mut visits = Vec::with_capacity(ids.len());
                for &id in ids {
                    if !seen.insert(id) {
                        continue;
                    }
                    match collection.get(id) {
                        Some(region) => visits.push((region, true)),
                        None => {
                            warn!(collection = %collection.name, id, "Selected region not found");
                            partition.dropped.push(DroppedRegion {
                                collection: collection.name.clone(),
                                id,
                                reason: DropReason::NotFound,
                            });
                        }
                    }
                }
                visits
            }
            None => collection.regions.iter().map(|r| (r, false)).collect(),
        };

        for (region, explicit) in visits {
            let epsg = region.zone_epsg;
            let key = if explicit || region.area > SINGLETON_AREA {
                format!("{}_{}", collection.name, region.id)
            } else {
                let base = self.cell_key(&collection.name, region.centroid);
                let subindex = overflow.entry(base.clone()).or_insert(0);
                loop {
                    let key = format!("{}_{}_{}", base, subindex, epsg);
                    let full = by_key
                        .get(&key)
                        .is_some_and(|&i| batches[i].len() >= MAX_BATCH_REGIONS);
                    if !full {
                        break key;
                    }
                    *subindex += 1;
                }
            };

            let index = *by_key.entry(key.clone()).or_insert_with(|| {
                batches.push(JobBatch::new(key, &collection.name, epsg));
                batches.len() - 1
            });
            let batch = &mut batches[index];

            batch.region_ids.push(region.id);
            if let Some(filter) = &self.config.filter_bbox {
                // fully inside on both axes, including north and south edges
                if !filter.contains_box(&region.envelope) {
                    batch.region_ids.pop();
                    warn!(
                        collection = %collection.name,
                        id = region.id,
                        envelope = %region.envelope,
                        filter = %filter,
                        "Region crosses filter box, dropping"
                    );
                    partition.dropped.push(DroppedRegion {
                        collection: collection.name.clone(),
                        id: region.id,
                        reason: DropReason::CrossesFilter,
                    });
                    continue;
                }
            }
            batch.envelopes.push(region.envelope);
            batch.area += region.area;
        }

        batches.sort_by(|a, b| b.area.total_cmp(&a.area));
        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            if batch.is_too_small(self.config.min_area) {
                debug!(job_id = %batch.job_id, area = batch.area, "Batch below minimum area, dropping");
                partition
                    .dropped
                    .extend(batch.region_ids.iter().map(|&id| DroppedRegion {
                        collection: batch.collection.clone(),
                        id,
                        reason: DropReason::BatchTooSmall,
                    }));
                continue;
            }
            partition.batches.push(batch);
        }
        partition
    }

    /// Base key of the grid cell containing a centroid.
    fn cell_key(&self, collection: &str, centroid: (f64, f64)) -> String {
        let cell = self.config.cell_size_deg;
        // + 0.0 normalises -0.0 so keys never print as "-0"
        let x = (centroid.0 / cell).floor() * cell + 0.0;
        let y = (centroid.1 / cell).floor() * cell + 0.0;
        format!("{}_{}_{}", collection, x, y)
    }

    /// Writes the batch's subset file unless it already exists.
    fn materialize(
        &self,
        collection: &RegionCollection,
        batch: &JobBatch,
        subset_dir: &Path,
    ) -> Result<BatchDescriptor, BatchingError> {
        let path = subset_dir.join(batch.subset_file_name());
        if path.exists() {
            debug!(job_id = %batch.job_id, path = %path.display(), "Subset already present");
        } else {
            let target = Projection::from_epsg(batch.epsg)?;
            let regions = batch
                .region_ids
                .iter()
                .filter_map(|&id| collection.get(id))
                .map(|r| r.reprojected(Projection::Geographic, target))
                .collect();
            let subset = RegionSubset {
                job_id: batch.job_id.clone(),
                epsg: batch.epsg,
                regions,
            };
            self.store.write_subset(&subset, &path)?;
            debug!(
                job_id = %batch.job_id,
                regions = batch.len(),
                epsg = batch.epsg,
                "Subset written"
            );
        }
        Ok(BatchDescriptor {
            job_id: batch.job_id.clone(),
            area: batch.area,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Geometry, JsonRegionStore};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn rect(collection: &str, id: RegionId, min_x: f64, min_y: f64, w: f64, h: f64) -> Region {
        Region::new(collection, id, Geometry::rectangle(min_x, min_y, min_x + w, min_y + h)).unwrap()
    }

    fn batcher(config: BatchConfig) -> RegionBatcher<JsonRegionStore> {
        RegionBatcher::new(JsonRegionStore::new(), config)
    }

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new(collections: &[(&str, Vec<Region>)]) -> Self {
            let temp = TempDir::new().unwrap();
            let store = JsonRegionStore::new();
            for (name, regions) in collections {
                store
                    .write_collection(&temp.path().join("watersheds").join(format!("{name}.json")), regions)
                    .unwrap();
            }
            Self { temp }
        }

        fn run(&self, config: BatchConfig) -> Result<BatchPlan, BatchingError> {
            batcher(config).run(
                &self.temp.path().join("watersheds"),
                &self.temp.path().join("watershed_subsets"),
                &self.manifest(),
            )
        }

        fn manifest(&self) -> PathBuf {
            self.temp.path().join("watershed_subset_token_0")
        }
    }

    #[test]
    fn test_singleton_and_grid_batch() {
        let fixture = Fixture::new(&[(
            "c",
            vec![
                rect("c", 1, 0.1, 0.1, 0.1, 1.0),
                rect("c", 2, 1.0, 1.0, 0.1, 1.0),
                rect("c", 3, 10.0, 10.0, 1.5, 1.0),
            ],
        )]);
        let plan = fixture.run(BatchConfig::default()).unwrap();

        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].job_id, "c_3");
        assert!((plan.batches[0].area - 1.5).abs() < 1e-9);
        assert_eq!(plan.batches[1].job_id, "c_0_0_0_32631");
        assert!((plan.batches[1].area - 0.2).abs() < 1e-9);
        assert!(plan.dropped.is_empty());

        let subset = JsonRegionStore::new().read_subset(&plan.batches[1].path).unwrap();
        assert_eq!(subset.epsg, 32631);
        assert_eq!(
            subset.regions.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(plan.batches[1]
            .path
            .ends_with("watershed_subsets/c_0_0_0_32631_a0.200.json"));
    }

    #[test]
    fn test_crossing_region_is_dropped() {
        let fixture = Fixture::new(&[(
            "c",
            vec![rect("c", 1, 0.5, 0.5, 0.2, 0.2), rect("c", 2, 4.5, 0.5, 0.2, 0.2)],
        )]);
        let config = BatchConfig::default().with_filter_bbox(BoundingBox::new(0.0, 0.0, 4.6, 4.0));
        let plan = fixture.run(config).unwrap();

        assert_eq!(plan.batches.len(), 1);
        assert_eq!(
            plan.dropped,
            vec![DroppedRegion {
                collection: "c".to_string(),
                id: 2,
                reason: DropReason::CrossesFilter,
            }]
        );
    }

    #[test]
    fn test_region_crossing_north_or_south_edge_is_dropped() {
        let collection = RegionCollection::new(
            "c",
            vec![
                rect("c", 1, 0.5, 0.5, 0.2, 0.2),
                rect("c", 2, 1.5, 3.9, 0.2, 0.2),
                rect("c", 3, 2.5, -0.1, 0.2, 0.2),
            ],
        );
        let config = BatchConfig::default().with_filter_bbox(BoundingBox::new(0.0, 0.0, 4.0, 4.0));
        let partition = batcher(config).partition(&collection);

        let kept: Vec<u64> = partition
            .batches
            .iter()
            .flat_map(|b| b.region_ids.iter().copied())
            .collect();
        assert_eq!(kept, vec![1]);
        assert_eq!(
            partition.dropped.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(partition
            .dropped
            .iter()
            .all(|d| d.reason == DropReason::CrossesFilter));
    }

    #[test]
    fn test_retraction_keeps_accepted_members() {
        let collection = RegionCollection::new(
            "c",
            vec![
                rect("c", 1, 0.5, 0.5, 0.2, 0.2),
                rect("c", 2, 1.5, 1.5, 0.3, 0.3),
                rect("c", 3, 2.9, 2.9, 0.2, 0.2),
            ],
        );
        let config = BatchConfig::default().with_filter_bbox(BoundingBox::new(0.0, 0.0, 3.0, 3.0));
        let partition = batcher(config).partition(&collection);

        assert_eq!(partition.batches.len(), 1);
        let batch = &partition.batches[0];
        assert_eq!(batch.region_ids, vec![1, 2]);
        assert_eq!(batch.envelopes.len(), 2);
        assert!((batch.area - (0.04 + 0.09)).abs() < 1e-9);
        assert_eq!(partition.dropped.len(), 1);
        assert_eq!(partition.dropped[0].id, 3);
    }

    #[test]
    fn test_crossing_singleton_leaves_no_batch() {
        let collection = RegionCollection::new("c", vec![rect("c", 1, 0.0, 0.0, 2.0, 2.0)]);
        let config = BatchConfig::default().with_filter_bbox(BoundingBox::new(0.5, 0.5, 10.0, 10.0));
        let partition = batcher(config).partition(&collection);
        assert!(partition.batches.is_empty());
        assert_eq!(partition.dropped[0].reason, DropReason::CrossesFilter);
    }

    #[test]
    fn test_small_batch_dropped_below_min_area() {
        let collection = RegionCollection::new(
            "c",
            vec![
                rect("c", 1, 0.5, 0.5, 0.1, 0.1),
                rect("c", 2, 20.5, 0.5, 0.1, 0.1),
                rect("c", 3, 20.7, 0.5, 0.1, 0.1),
                rect("c", 4, 20.9, 0.5, 0.1, 0.1),
            ],
        );
        let partition = batcher(BatchConfig::default().with_min_area(0.5)).partition(&collection);

        // three members escape the minimum area
        assert_eq!(partition.batches.len(), 1);
        assert_eq!(partition.batches[0].region_ids, vec![2, 3, 4]);
        assert_eq!(
            partition.dropped,
            vec![DroppedRegion {
                collection: "c".to_string(),
                id: 1,
                reason: DropReason::BatchTooSmall,
            }]
        );
    }

    #[test]
    fn test_overflow_opens_sibling_batches() {
        let regions: Vec<Region> = (0..2500)
            .map(|i| {
                let x = 0.5 + (i % 50) as f64 * 0.05;
                let y = 0.5 + (i / 50) as f64 * 0.05;
                rect("c", i, x, y, 0.01, 0.01)
            })
            .collect();
        let collection = RegionCollection::new("c", regions);
        let partition = batcher(BatchConfig::default()).partition(&collection);

        let mut sizes: Vec<(String, usize)> = partition
            .batches
            .iter()
            .map(|b| (b.job_id.clone(), b.len()))
            .collect();
        sizes.sort();
        assert_eq!(
            sizes,
            vec![
                ("c_0_0_0_32631".to_string(), 1000),
                ("c_0_0_1_32631".to_string(), 1000),
                ("c_0_0_2_32631".to_string(), 500),
            ]
        );
    }

    #[test]
    fn test_explicit_subset() {
        let fixture = Fixture::new(&[
            (
                "a",
                vec![rect("a", 1, 0.5, 0.5, 0.1, 0.1), rect("a", 2, 0.7, 0.5, 0.1, 0.1)],
            ),
            ("b", vec![rect("b", 1, 0.5, 0.5, 0.1, 0.1)]),
        ]);
        let mut subset = ExplicitSubset::new();
        subset.insert("a".to_string(), vec![2, 9, 2]);
        let plan = fixture.run(BatchConfig::default().with_subset(subset)).unwrap();

        assert_eq!(
            plan.batches.iter().map(|b| b.job_id.as_str()).collect::<Vec<_>>(),
            vec!["a_2"]
        );
        assert_eq!(plan.dropped.len(), 1);
        assert_eq!(plan.dropped[0].reason, DropReason::NotFound);
        assert_eq!(plan.dropped[0].id, 9);
    }

    #[test]
    fn test_batches_sorted_across_collections() {
        let fixture = Fixture::new(&[
            ("a", vec![rect("a", 1, 0.5, 0.5, 1.2, 1.0)]),
            ("b", vec![rect("b", 1, 10.0, 10.0, 2.0, 1.0)]),
        ]);
        let plan = fixture.run(BatchConfig::default()).unwrap();
        assert_eq!(
            plan.batches.iter().map(|b| b.job_id.as_str()).collect::<Vec<_>>(),
            vec!["b_1", "a_1"]
        );
    }

    #[test]
    fn test_duplicate_job_id_is_fatal() {
        // the grid key of "x" collides with the singleton key of "x_0_0_0"
        let fixture = Fixture::new(&[
            ("x", vec![rect("x", 1, 0.5, 0.5, 0.1, 0.1)]),
            ("x_0_0_0", vec![rect("x_0_0_0", 32631, 0.5, 0.5, 1.2, 1.0)]),
        ]);
        let err = fixture.run(BatchConfig::default()).unwrap_err();
        assert!(matches!(err, BatchingError::DuplicateJobId(id) if id == "x_0_0_0_32631"));
        assert!(!fixture.manifest().exists());
    }

    #[test]
    fn test_rerun_with_manifest_is_noop() {
        let fixture = Fixture::new(&[("c", vec![rect("c", 1, 0.5, 0.5, 0.2, 0.2)])]);
        let first = fixture.run(BatchConfig::default()).unwrap();
        assert!(fixture.manifest().exists());

        std::fs::remove_file(&first.batches[0].path).unwrap();
        let second = fixture.run(BatchConfig::default()).unwrap();

        assert_eq!(first, second);
        assert!(!second.batches[0].path.exists());
    }

    #[test]
    fn test_invalid_cell_size() {
        let fixture = Fixture::new(&[("c", vec![])]);
        let err = fixture
            .run(BatchConfig::default().with_cell_size(0.0))
            .unwrap_err();
        assert!(matches!(err, BatchingError::InvalidCellSize(_)));
        assert!(!fixture.manifest().exists());
    }

    #[test]
    fn test_negative_cell_coordinates() {
        let collection = RegionCollection::new("c", vec![rect("c", 1, -0.5, -0.5, 0.2, 0.2)]);
        let partition = batcher(BatchConfig::default()).partition(&collection);
        assert_eq!(partition.batches[0].job_id, "c_-4_-4_0_32730");
    }

    // =========================================================================
    // Property tests
    // =========================================================================

    fn region_strategy() -> impl Strategy<Value = Vec<(f64, f64, f64, f64)>> {
        prop::collection::vec(
            (-30.0f64..30.0, -30.0f64..30.0, 0.01f64..1.5, 0.01f64..1.5),
            0..120,
        )
    }

    proptest! {
        #[test]
        fn prop_every_region_accounted_once(
            specs in region_strategy(),
            min_area in 0.0f64..2.0,
            filter in prop::option::of((-20.0f64..0.0, -20.0f64..0.0, 0.0f64..20.0, 0.0f64..20.0)),
        ) {
            let regions: Vec<Region> = specs
                .iter()
                .enumerate()
                .map(|(i, &(x, y, w, h))| rect("c", i as RegionId, x, y, w, h))
                .collect();
            let collection = RegionCollection::new("c", regions);
            let mut config = BatchConfig::default().with_min_area(min_area);
            if let Some((a, b, c, d)) = filter {
                config = config.with_filter_bbox(BoundingBox::new(a, b, c, d));
            }
            let partition = batcher(config).partition(&collection);

            let mut seen = HashSet::new();
            for batch in &partition.batches {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= MAX_BATCH_REGIONS);
                prop_assert_eq!(batch.len(), batch.envelopes.len());
                for id in &batch.region_ids {
                    prop_assert!(seen.insert(*id), "region {} batched twice", id);
                }
            }
            for dropped in &partition.dropped {
                prop_assert!(seen.insert(dropped.id), "region {} batched and dropped", dropped.id);
            }
            prop_assert_eq!(seen.len(), specs.len());

            let ids: HashSet<&str> = partition.batches.iter().map(|b| b.job_id.as_str()).collect();
            prop_assert_eq!(ids.len(), partition.batches.len());

            for pair in partition.batches.windows(2) {
                prop_assert!(pair[0].area >= pair[1].area);
            }
        }
    }
}
