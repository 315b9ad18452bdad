//! Batch command - group watersheds into batches without running models.

use super::common::{batch_scenario, load_scenarios, pipeline_for, print_plan};
use crate::error::CliError;

/// Arguments for the batch command.
pub struct BatchArgs {
    pub configs: Vec<String>,
    pub min_area: Option<f64>,
}

/// Run the batch command.
pub fn run(args: BatchArgs) -> Result<(), CliError> {
    for scenario in load_scenarios(&args.configs, args.min_area)? {
        let pipeline = pipeline_for(&scenario);
        let plan = batch_scenario(&scenario, &pipeline)?;
        print_plan(&scenario, &plan);
    }
    Ok(())
}
