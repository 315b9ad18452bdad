//! Scenario configuration files.
//!
//! One INI file describes one scenario: where the watersheds and workspace
//! live, how regions are batched, how many batches run at once and which
//! models run with which inputs.
//!
//! ```ini
//! [scenario]
//! workspace_dir = /data/run
//! watersheds_dir = /data/watersheds
//!
//! [sdr]
//! command = /opt/models/sdr
//!
//! [sdr.inputs]
//! dem = /data/dem.grid
//! ```

mod parser;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::batch::BatchConfig;
use crate::model::{CommandModel, ModelKind};
use crate::pipeline::{ModelRun, PipelineConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("Missing configuration: {section}.{key}")]
    Missing { section: String, key: String },

    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid config pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

/// A model that runs as part of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSection {
    pub run: ModelRun,
    /// Program and leading arguments of the model executable.
    pub command: String,
}

impl ModelSection {
    /// External-process model for this section.
    pub fn command_model(&self) -> Option<CommandModel> {
        CommandModel::from_command_line(&self.command)
    }
}

/// Everything one scenario file configures.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub name: String,
    pub watersheds_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub batching: BatchConfig,
    /// Enabled models, SDR before NDR.
    pub models: Vec<ModelSection>,
}

impl ScenarioConfig {
    /// Loads a scenario file; the name defaults to the file stem.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = ini::Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scenario".to_string());
        parser::parse_ini(&ini, &stem)
    }

    /// Parses scenario text; used for tests and embedded configs.
    pub fn parse(text: &str, default_name: &str) -> Result<Self, ConfigError> {
        let ini = ini::Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from(default_name),
            source: ini::Error::Parse(e),
        })?;
        parser::parse_ini(&ini, default_name)
    }

    pub fn model(&self, kind: ModelKind) -> Option<&ModelSection> {
        self.models.iter().find(|m| m.run.kind == kind)
    }
}

/// Expands file paths and glob patterns into a sorted, deduplicated list of
/// config files.
pub fn expand_patterns<I, S>(patterns: I) -> Result<Vec<PathBuf>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut paths = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let matches = glob::glob(pattern).map_err(|e| ConfigError::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let before = paths.len();
        for entry in matches {
            match entry {
                Ok(path) => paths.push(path),
                Err(e) => {
                    return Err(ConfigError::Pattern {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        if paths.len() == before {
            return Err(ConfigError::Pattern {
                pattern: pattern.to_string(),
                reason: "matched no files".to_string(),
            });
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
