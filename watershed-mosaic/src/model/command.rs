//! External-process region model.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{ModelError, ModelInvocation, RegionModel};

/// Name of the invocation file written into each job workspace.
pub const INVOCATION_FILE: &str = "model_invocation.json";

/// Longest stderr excerpt kept in a [`ModelError::Failed`].
const STDERR_EXCERPT: usize = 2048;

/// Runs the model as `<program> [args…] <workspace>/model_invocation.json`.
///
/// Each invocation is a separate OS process, so a crashing model takes down
/// only its own job.
#[derive(Debug, Clone)]
pub struct CommandModel {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandModel {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Parses a whitespace-separated command line: program then arguments.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl RegionModel for CommandModel {
    fn run(&self, invocation: &ModelInvocation) -> Result<(), ModelError> {
        let path = invocation.workspace_dir.join(INVOCATION_FILE);
        let invocation_err = |reason: String| ModelError::Invocation {
            path: path.clone(),
            reason,
        };
        fs::create_dir_all(&invocation.workspace_dir).map_err(|e| invocation_err(e.to_string()))?;
        let json =
            serde_json::to_vec_pretty(invocation).map_err(|e| invocation_err(e.to_string()))?;
        fs::write(&path, json).map_err(|e| invocation_err(e.to_string()))?;

        debug!(
            job_id = %invocation.job_id,
            program = %self.program.display(),
            "Starting model process"
        );
        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .current_dir(&invocation.workspace_dir)
            .output()
            .map_err(|source| ModelError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr
                .chars()
                .rev()
                .take(STDERR_EXCERPT)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            warn!(
                job_id = %invocation.job_id,
                code = ?output.status.code(),
                "Model process failed"
            );
            return Err(ModelError::Failed {
                job_id: invocation.job_id.clone(),
                code: output.status.code(),
                stderr: excerpt.trim().to_string(),
            });
        }

        info!(
            job_id = %invocation.job_id,
            kind = %invocation.kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model run complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn invocation(workspace: &std::path::Path) -> ModelInvocation {
        ModelInvocation {
            kind: ModelKind::Sdr,
            job_id: "c_1".to_string(),
            workspace_dir: workspace.to_path_buf(),
            inputs: BTreeMap::new(),
            subset_path: workspace.join("subset.json"),
            single_outlet: true,
            target_pixel_size: 90.0,
            epsg: 32633,
            params: BTreeMap::new(),
            result_suffix: None,
        }
    }

    #[test]
    fn test_from_command_line() {
        let model = CommandModel::from_command_line("/opt/sdr --fast  --threads 2").unwrap();
        assert_eq!(model.program(), &PathBuf::from("/opt/sdr"));
        assert_eq!(model.args, vec!["--fast", "--threads", "2"]);
        assert!(CommandModel::from_command_line("   ").is_none());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let model = CommandModel::new(temp.path().join("no-such-model"));
        let err = model.run(&invocation(temp.path())).unwrap_err();
        assert!(matches!(err, ModelError::Spawn { .. }));
        // the invocation is written before the process starts
        assert!(temp.path().join(INVOCATION_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_receives_invocation_path() {
        let temp = TempDir::new().unwrap();
        let model = CommandModel::new("sh").with_args(["-c", "test -f \"$0\" && touch usle.grid"]);
        model.run(&invocation(temp.path())).unwrap();
        assert!(temp.path().join("usle.grid").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_failure() {
        let temp = TempDir::new().unwrap();
        let model = CommandModel::new("sh").with_args(["-c", "echo boom >&2; exit 3"]);
        let err = model.run(&invocation(temp.path())).unwrap_err();
        match err {
            ModelError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
