//! Run command - batch every scenario, then run each enabled model.

use std::sync::Arc;

use tracing::{error, info};
use watershed_mosaic::config::ScenarioConfig;
use watershed_mosaic::pipeline::PipelineError;

use super::common::{batch_scenario, load_scenarios, pipeline_for, print_plan};
use crate::error::CliError;

/// Arguments for the run command.
pub struct RunArgs {
    pub configs: Vec<String>,
    pub min_area: Option<f64>,
}

/// Run the run command.
///
/// A failing scenario does not stop the remaining ones; the command fails at
/// the end if any scenario failed.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let scenarios = load_scenarios(&args.configs, args.min_area)?;
    let runtime = tokio::runtime::Runtime::new().map_err(CliError::Runtime)?;

    let mut failed = Vec::new();
    for scenario in &scenarios {
        if let Err(e) = runtime.block_on(run_scenario(scenario)) {
            error!(scenario = %scenario.name, error = %e, "Scenario failed");
            eprintln!("Scenario '{}' failed: {}", scenario.name, e);
            failed.push(scenario.name.clone());
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::ScenariosFailed(failed))
    }
}

async fn run_scenario(scenario: &ScenarioConfig) -> Result<(), CliError> {
    let pipeline = pipeline_for(scenario);
    let plan = batch_scenario(scenario, &pipeline)?;
    print_plan(scenario, &plan);

    let mut model_failures = 0;
    for section in &scenario.models {
        let kind = section.run.kind;
        let model = section
            .command_model()
            .ok_or_else(|| CliError::ModelCommand {
                scenario: scenario.name.clone(),
                model: kind.to_string(),
            })?;

        match pipeline.run_model(&section.run, Arc::new(model), &plan.batches).await {
            Ok(report) => {
                info!(scenario = %scenario.name, %kind, "Model run complete");
                println!(
                    "  {}: {} emitted, {} skipped, {} scratch dirs deleted",
                    kind,
                    report.schedule.emitted(),
                    report.schedule.skipped(),
                    report.cleanup.deleted
                );
            }
            Err(PipelineError::RunFailed { report, .. }) => {
                model_failures += 1;
                println!(
                    "  {}: {} emitted, {} skipped, {} failed",
                    kind,
                    report.schedule.emitted(),
                    report.schedule.skipped(),
                    report.schedule.failed()
                );
                for job in report.schedule.failures() {
                    eprintln!("    {}: {}", job.job_id, job.outcome);
                }
                for (output, reason) in &report.stitch_failures {
                    eprintln!("    stitch {}: {}", output, reason);
                }
            }
            Err(e) => {
                model_failures += 1;
                eprintln!("  {}: {}", kind, e);
            }
        }
    }

    if model_failures > 0 {
        return Err(CliError::ModelRunsFailed {
            scenario: scenario.name.clone(),
            failed: model_failures,
        });
    }
    Ok(())
}
