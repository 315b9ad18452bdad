//! Region collection and subset persistence.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Geometry, PolygonRings, Region, RegionCollection, RegionError, RegionId, RegionSubset};

/// File extension for collections and subsets written by [`JsonRegionStore`].
pub const SUBSET_EXTENSION: &str = "json";

/// Reads region collections and writes per-batch region subsets.
///
/// The batcher only ever talks to this trait, so alternative vector formats
/// plug in without touching the partitioning logic.
pub trait RegionStore: Send + Sync {
    /// Lists the collection files directly inside `dir`, sorted by path.
    fn list_collections(&self, dir: &Path) -> Result<Vec<PathBuf>, RegionError>;

    /// Reads every feature of a collection.
    fn read_collection(&self, path: &Path) -> Result<RegionCollection, RegionError>;

    /// Persists a subset.
    fn write_subset(&self, subset: &RegionSubset, path: &Path) -> Result<(), RegionError>;

    /// Reads a subset written by [`RegionStore::write_subset`].
    fn read_subset(&self, path: &Path) -> Result<RegionSubset, RegionError>;
}

/// On-disk feature record: an id and its polygons in lon/lat degrees.
#[derive(Debug, Serialize, Deserialize)]
struct FeatureRecord {
    id: RegionId,
    polygons: Vec<PolygonRings>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionRecord {
    features: Vec<FeatureRecord>,
}

/// JSON implementation of [`RegionStore`].
///
/// A collection file looks like:
///
/// ```text
/// {"features": [{"id": 17, "polygons": [[[[lon, lat], ...]]]}]}
/// ```
///
/// The collection name is the file stem.
#[derive(Debug, Clone, Default)]
pub struct JsonRegionStore;

impl JsonRegionStore {
    pub fn new() -> Self {
        Self
    }

    /// Writes a collection file, used by fixtures and data preparation.
    pub fn write_collection(&self, path: &Path, regions: &[Region]) -> Result<(), RegionError> {
        let record = CollectionRecord {
            features: regions
                .iter()
                .map(|r| FeatureRecord {
                    id: r.id,
                    polygons: r.geometry.polygons.clone(),
                })
                .collect(),
        };
        write_json(path, &record)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RegionError> {
    let write_err = |source| RegionError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let file = fs::File::create(path).map_err(write_err)?;
    serde_json::to_writer(BufWriter::new(file), value).map_err(|e| RegionError::Write {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, RegionError> {
    let file = fs::File::open(path).map_err(|source| RegionError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| RegionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn collection_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl RegionStore for JsonRegionStore {
    fn list_collections(&self, dir: &Path) -> Result<Vec<PathBuf>, RegionError> {
        let pattern = dir.join(format!("*.{}", SUBSET_EXTENSION));
        let pattern = pattern.to_string_lossy();
        let list_err = |reason: String| RegionError::List {
            dir: dir.to_path_buf(),
            reason,
        };
        let mut paths = glob::glob(&pattern)
            .map_err(|e| list_err(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| list_err(e.to_string()))?;
        paths.sort();
        Ok(paths)
    }

    fn read_collection(&self, path: &Path) -> Result<RegionCollection, RegionError> {
        let name = collection_name(path);
        let record: CollectionRecord = read_json(path)?;
        let regions = record
            .features
            .into_iter()
            .map(|f| Region::new(name.clone(), f.id, Geometry::new(f.polygons)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegionCollection::new(name, regions))
    }

    fn write_subset(&self, subset: &RegionSubset, path: &Path) -> Result<(), RegionError> {
        write_json(path, subset)
    }

    fn read_subset(&self, path: &Path) -> Result<RegionSubset, RegionError> {
        read_json(path)
    }
}
