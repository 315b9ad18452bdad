//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

use watershed_mosaic::batch::BatchingError;
use watershed_mosaic::config::ConfigError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(std::io::Error),
    /// Scenario file could not be found or parsed
    Config(ConfigError),
    /// Batching a scenario failed
    Batching { scenario: String, error: BatchingError },
    /// A model section has no usable command line
    ModelCommand { scenario: String, model: String },
    /// Some model runs of a scenario failed
    ModelRunsFailed { scenario: String, failed: usize },
    /// Failed to start the async runtime
    Runtime(std::io::Error),
    /// One or more scenarios did not finish cleanly
    ScenariosFailed(Vec<String>),
}

impl CliError {
    /// Exit the process with an error message and non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::ScenariosFailed(_) = self {
            eprintln!();
            eprintln!("Job workspaces of failed batches are kept; see the log for details.");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Batching { scenario, error } => {
                write!(f, "Batching scenario '{}' failed: {}", scenario, error)
            }
            CliError::ModelCommand { scenario, model } => {
                write!(f, "Scenario '{}': [{}] command is empty", scenario, model)
            }
            CliError::ModelRunsFailed { scenario, failed } => {
                write!(f, "Scenario '{}': {} model run(s) failed", scenario, failed)
            }
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
            CliError::ScenariosFailed(names) => {
                write!(f, "{} scenario(s) failed: {}", names.len(), names.join(", "))
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::Config(e) => Some(e),
            CliError::Batching { error, .. } => Some(error),
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}
