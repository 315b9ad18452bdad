//! Region model collaborator.
//!
//! A region model turns a batch's aligned input rasters into a fixed set of
//! named output rasters inside the batch workspace. Two model kinds are
//! supported, sediment delivery ([`ModelKind::Sdr`]) and nutrient delivery
//! ([`ModelKind::Ndr`]); they differ only in their input and output lists.
//!
//! The model itself is an external concern, reached through the
//! [`RegionModel`] trait. [`CommandModel`] runs it as a separate process.

mod command;

pub use command::{CommandModel, INVOCATION_FILE};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raster::{ResampleMethod, GRID_EXTENSION};

/// Errors reported by a region model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to start model {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("model failed for job {job_id} (exit code {code:?}): {stderr}")]
    Failed {
        job_id: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to write model invocation {path}: {reason}")]
    Invocation { path: PathBuf, reason: String },

    #[error("model error: {0}")]
    Other(String),
}

/// Supported model kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Sdr,
    Ndr,
}

/// One raster input of a model kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInput {
    pub name: &'static str,
    /// Resampling used for alignment; `None` passes the raster through as is.
    pub resample: Option<ResampleMethod>,
    pub required: bool,
}

const fn aligned(name: &'static str, method: ResampleMethod, required: bool) -> ModelInput {
    ModelInput {
        name,
        resample: Some(method),
        required,
    }
}

const fn passthrough(name: &'static str) -> ModelInput {
    ModelInput {
        name,
        resample: None,
        required: false,
    }
}

const SDR_INPUTS: &[ModelInput] = &[
    aligned("dem", ResampleMethod::Bilinear, true),
    aligned("erosivity", ResampleMethod::Bilinear, true),
    aligned("erodibility", ResampleMethod::Bilinear, true),
    aligned("lulc", ResampleMethod::Mode, true),
    passthrough("usle_c"),
    passthrough("usle_p"),
];

const NDR_INPUTS: &[ModelInput] = &[
    aligned("dem", ResampleMethod::Bilinear, true),
    aligned("runoff_proxy", ResampleMethod::Bilinear, true),
    aligned("lulc", ResampleMethod::Mode, true),
    aligned("fertilizer", ResampleMethod::Bilinear, false),
];

const SDR_OUTPUTS: &[&str] = &["sed_export", "sed_retention", "sed_deposition", "usle"];

const NDR_OUTPUTS: &[&str] = &[
    "n_export",
    "n_retention",
    "intermediate_outputs/modified_load_n",
];

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Sdr, ModelKind::Ndr];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Sdr => "sdr",
            ModelKind::Ndr => "ndr",
        }
    }

    pub fn inputs(&self) -> &'static [ModelInput] {
        match self {
            ModelKind::Sdr => SDR_INPUTS,
            ModelKind::Ndr => NDR_INPUTS,
        }
    }

    pub fn input(&self, name: &str) -> Option<&'static ModelInput> {
        self.inputs().iter().find(|i| i.name == name)
    }

    /// Output maps written into each job workspace, without suffix or
    /// extension.
    pub fn default_outputs(&self) -> &'static [&'static str] {
        match self {
            ModelKind::Sdr => SDR_OUTPUTS,
            ModelKind::Ndr => NDR_OUTPUTS,
        }
    }

    /// Directory under the scenario workspace holding every job workspace.
    pub fn workspace_dir_name(&self) -> String {
        format!("{}_workspace", self.name())
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sdr" => Ok(ModelKind::Sdr),
            "ndr" => Ok(ModelKind::Ndr),
            other => Err(format!("unknown model kind: {}", other)),
        }
    }
}

/// Appends an optional result suffix before the extension.
///
/// `sed_export.grid` with suffix `2020` becomes `sed_export_2020.grid`. A
/// leading `_` in the suffix is not doubled.
pub fn with_suffix(path: &Path, suffix: Option<&str>) -> PathBuf {
    let Some(suffix) = suffix.filter(|s| !s.is_empty()) else {
        return path.to_path_buf();
    };
    let suffix = suffix.trim_start_matches('_');
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    };
    path.with_file_name(name)
}

/// Default local output path (relative to a job workspace) for an output map.
pub fn default_output_path(map: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", map, GRID_EXTENSION))
}

/// Everything a model run needs, serialized for external models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInvocation {
    pub kind: ModelKind,
    pub job_id: String,
    pub workspace_dir: PathBuf,
    /// Input name to raster path (aligned or passed through).
    pub inputs: BTreeMap<String, PathBuf>,
    /// Region subset of the batch, in the batch projection.
    pub subset_path: PathBuf,
    /// True when the batch holds exactly one region.
    pub single_outlet: bool,
    pub target_pixel_size: f64,
    pub epsg: u32,
    /// Free-form model parameters.
    pub params: BTreeMap<String, String>,
    pub result_suffix: Option<String>,
}

/// Runs a region model synchronously.
///
/// Implementations write every declared output into
/// [`ModelInvocation::workspace_dir`]. The call blocks, so async callers run
/// it on the blocking pool.
pub trait RegionModel: Send + Sync {
    fn run(&self, invocation: &ModelInvocation) -> Result<(), ModelError>;
}

impl<M: RegionModel + ?Sized> RegionModel for std::sync::Arc<M> {
    fn run(&self, invocation: &ModelInvocation) -> Result<(), ModelError> {
        (**self).run(invocation)
    }
}
