//! Batch manifest: the completion marker of a batching run.
//!
//! The manifest doubles as the idempotence token. When it exists the batcher
//! returns the stored plan instead of partitioning again.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{BatchPlan, BatchingError};

/// File name prefix of the manifest inside a scenario workspace.
pub const MANIFEST_PREFIX: &str = "watershed_subset_token";

/// Persisted result of a batching run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    /// Local wall-clock time the run completed (`%Y-%m-%d %H:%M:%S`).
    pub completed_at: String,
    pub plan: BatchPlan,
}

impl BatchManifest {
    /// Wraps a plan with the current timestamp.
    pub fn new(plan: BatchPlan) -> Self {
        Self {
            completed_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            plan,
        }
    }

    /// Manifest path for a workspace and minimum-area threshold.
    ///
    /// The threshold is part of the name so runs with different thresholds do
    /// not reuse each other's plans.
    pub fn path_for(workspace_dir: &Path, min_area: f64) -> PathBuf {
        workspace_dir.join(format!("{}_{}", MANIFEST_PREFIX, min_area))
    }

    pub fn load(path: &Path) -> Result<Self, BatchingError> {
        let file = fs::File::open(path).map_err(|e| BatchingError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| BatchingError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), BatchingError> {
        let manifest_err = |reason: String| BatchingError::Manifest {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| manifest_err(e.to_string()))?;
        }
        let file = fs::File::create(path).map_err(|e| manifest_err(e.to_string()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| manifest_err(e.to_string()))
    }
}
