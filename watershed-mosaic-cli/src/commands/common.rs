//! Scenario loading and batching shared by the CLI commands.

use std::sync::Arc;

use tracing::info;
use watershed_mosaic::batch::{BatchPlan, DropReason, RegionBatcher};
use watershed_mosaic::config::{expand_patterns, ScenarioConfig};
use watershed_mosaic::pipeline::Pipeline;
use watershed_mosaic::raster::GridStore;
use watershed_mosaic::region::JsonRegionStore;

use crate::error::CliError;

/// Loads every scenario matched by `patterns`, applying a CLI `--min-area`
/// override.
pub fn load_scenarios(
    patterns: &[String],
    min_area: Option<f64>,
) -> Result<Vec<ScenarioConfig>, CliError> {
    let paths = expand_patterns(patterns)?;
    let mut scenarios = Vec::with_capacity(paths.len());
    for path in paths {
        let mut scenario = ScenarioConfig::load(&path)?;
        if let Some(min_area) = min_area {
            scenario.batching.min_area = min_area;
        }
        info!(scenario = %scenario.name, config = %path.display(), "Loaded scenario");
        scenarios.push(scenario);
    }
    Ok(scenarios)
}

/// Pipeline over the grid raster store and JSON region store.
pub fn pipeline_for(scenario: &ScenarioConfig) -> Pipeline {
    Pipeline::new(
        scenario.pipeline.clone(),
        Arc::new(GridStore::new()),
        Arc::new(JsonRegionStore::new()),
    )
}

/// Batches one scenario's watersheds.
pub fn batch_scenario(scenario: &ScenarioConfig, pipeline: &Pipeline) -> Result<BatchPlan, CliError> {
    let batcher = RegionBatcher::new(JsonRegionStore::new(), scenario.batching.clone());
    pipeline
        .run_batching(&batcher, &scenario.watersheds_dir)
        .map_err(|error| CliError::Batching {
            scenario: scenario.name.clone(),
            error,
        })
}

/// Prints a short plan summary.
pub fn print_plan(scenario: &ScenarioConfig, plan: &BatchPlan) {
    let count = |reason: DropReason| plan.dropped.iter().filter(|d| d.reason == reason).count();
    let area: f64 = plan.batches.iter().map(|b| b.area).sum();

    println!("Scenario: {}", scenario.name);
    println!("  Batches:          {}", plan.batches.len());
    println!("  Total area:       {:.3}", area);
    if let Some(largest) = plan.batches.first() {
        println!("  Largest batch:    {} ({:.3})", largest.job_id, largest.area);
    }
    println!("  Dropped (filter): {}", count(DropReason::CrossesFilter));
    println!("  Dropped (small):  {}", count(DropReason::BatchTooSmall));
    println!("  Dropped (absent): {}", count(DropReason::NotFound));
}
