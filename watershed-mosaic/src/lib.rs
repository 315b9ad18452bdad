//! Watershed Mosaic - batched per-watershed model runs stitched into global
//! rasters.
//!
//! Watershed polygons are grouped into spatially coherent batches, each batch
//! runs a hydrological model (SDR or NDR) on inputs aligned to its UTM zone,
//! and every model output is merged into one global mosaic per output while
//! per-batch scratch space is reclaimed as soon as all outputs have consumed
//! it.
//!
//! # Modules
//!
//! - [`geo`] bounding boxes and geographic/UTM projections
//! - [`region`] watershed polygons, collections and subsets
//! - [`batch`] grid-cell batching and the batch manifest
//! - [`raster`] raster collaborator trait and the grid reference store
//! - [`model`] model kinds and the external-process model
//! - [`executor`] batch jobs and the bounded scheduler
//! - [`stitch`] per-output mosaic workers
//! - [`cleanup`] scratch directory reclamation
//! - [`pipeline`] wiring of one model run
//! - [`config`] scenario INI files
//! - [`logging`] subscriber setup for the CLI

pub mod batch;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod geo;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod raster;
pub mod region;
pub mod stitch;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
