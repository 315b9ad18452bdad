//! Raster storage and operations.
//!
//! The pipeline needs four raster operations: reading georeferencing info,
//! creating an empty global mosaic, warping an input onto a batch grid
//! (clip, reproject, resample, mask) and stitching per-job rasters into a
//! mosaic. They are expressed by the [`RasterStore`] trait so the batch jobs
//! and stitch workers never depend on a particular file format.
//!
//! [`GridStore`] implements the trait over [`GridRaster`] files: a
//! self-describing, bincode-encoded single-band `f32` grid.
//!
//! # Overlap policies
//!
//! | Policy    | Destination pixel after stitching a valid source value |
//! |-----------|--------------------------------------------------------|
//! | `Replace` | the source value (last writer wins)                    |
//! | `Add`     | destination + source, or source when destination nodata |
//! | `Etch`    | unchanged unless destination is nodata                 |
//!
//! With [`StitchOptions::area_weighted`] set, each source value is first
//! multiplied by the ratio of the destination to the source pixel area in
//! m², so per-pixel totals stay comparable across projections.

mod grid;
mod sample;

pub use grid::{GridRaster, GridStore, GRID_EXTENSION};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{BoundingBox, GeoError, WGS84_EPSG};
use crate::region::RegionSubset;

/// Nodata value of every mosaic created by the pipeline.
pub const MOSAIC_NODATA: f32 = -9999.0;

/// Errors raised by raster operations.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("raster not found: {0}")]
    NotFound(PathBuf),

    #[error("raster I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode raster {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("failed to encode raster {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("empty extent {bounds} for {path}")]
    EmptyExtent { path: PathBuf, bounds: BoundingBox },

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error(transparent)]
    Projection(#[from] GeoError),
}

/// How source pixels are sampled onto a destination grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    #[default]
    Nearest,
    Bilinear,
    /// Most frequent value under the destination pixel footprint.
    Mode,
}

/// How a stitched value combines with the existing mosaic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    #[default]
    Replace,
    Add,
    Etch,
}

impl OverlapPolicy {
    #[inline]
    fn apply(self, dst: &mut f32, value: f32, dst_nodata: f32) {
        let empty = is_nodata(*dst, dst_nodata);
        match self {
            OverlapPolicy::Replace => *dst = value,
            OverlapPolicy::Add if empty => *dst = value,
            OverlapPolicy::Add => *dst += value,
            OverlapPolicy::Etch if empty => *dst = value,
            OverlapPolicy::Etch => {}
        }
    }
}

#[inline]
pub(crate) fn is_nodata(value: f32, nodata: f32) -> bool {
    value.is_nan() || value == nodata
}

/// Georeferencing of a raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    /// `[origin_x, pixel_width, 0, origin_y, 0, -pixel_height]`
    pub geotransform: [f64; 6],
    pub epsg: u32,
    pub nodata: f32,
}

impl RasterInfo {
    /// Extent in the raster's own coordinate system.
    pub fn bounds(&self) -> BoundingBox {
        let gt = &self.geotransform;
        let x1 = gt[0] + self.width as f64 * gt[1];
        let y1 = gt[3] + self.height as f64 * gt[5];
        BoundingBox::new(gt[0].min(x1), gt[3].min(y1), gt[0].max(x1), gt[3].max(y1))
    }

    /// Positive pixel size `(x, y)`.
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.geotransform[1].abs(), self.geotransform[5].abs())
    }
}

/// Layout of a new global mosaic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosaicSpec {
    /// Extent in geographic coordinates.
    pub bounds: BoundingBox,
    /// Pixel size in degrees.
    pub pixel_size: f64,
    pub epsg: u32,
    pub nodata: f32,
}

impl MosaicSpec {
    /// Geographic mosaic with the pipeline's nodata value.
    pub fn geographic(bounds: BoundingBox, pixel_size: f64) -> Self {
        Self {
            bounds,
            pixel_size,
            epsg: WGS84_EPSG,
            nodata: MOSAIC_NODATA,
        }
    }

    /// `(columns, rows)`, truncating partial pixels.
    pub fn dimensions(&self) -> (usize, usize) {
        (
            (self.bounds.width() / self.pixel_size) as usize,
            (self.bounds.height() / self.pixel_size) as usize,
        )
    }

    pub fn geotransform(&self) -> [f64; 6] {
        [
            self.bounds.min_x,
            self.pixel_size,
            0.0,
            self.bounds.max_y,
            0.0,
            -self.pixel_size,
        ]
    }
}

/// Parameters of a warp.
///
/// Unset fields keep the source's value: its projection, its extent
/// (transformed to the target projection) and its pixel size.
#[derive(Debug, Clone, Default)]
pub struct WarpOptions {
    pub target_epsg: Option<u32>,
    /// Output extent in the target projection.
    pub bounds: Option<BoundingBox>,
    /// Positive output pixel size `(x, y)` in target units.
    pub pixel_size: Option<(f64, f64)>,
    pub resample: Option<ResampleMethod>,
    /// Pixels whose centre lies outside every subset polygon become nodata.
    pub mask: Option<Arc<RegionSubset>>,
}

impl WarpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_epsg(mut self, epsg: u32) -> Self {
        self.target_epsg = Some(epsg);
        self
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = Some((x, y));
        self
    }

    pub fn with_resample(mut self, method: ResampleMethod) -> Self {
        self.resample = Some(method);
        self
    }

    pub fn with_mask(mut self, subset: Arc<RegionSubset>) -> Self {
        self.mask = Some(subset);
        self
    }
}

/// Parameters for [`RasterStore::stitch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StitchOptions {
    pub resample: ResampleMethod,
    pub overlap: OverlapPolicy,
    /// Treat source values as per-pixel quantities: each value is scaled by
    /// the destination pixel area over the source pixel area, both in m².
    pub area_weighted: bool,
}

impl StitchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resample(mut self, method: ResampleMethod) -> Self {
        self.resample = method;
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_area_weighting(mut self, enabled: bool) -> Self {
        self.area_weighted = enabled;
        self
    }
}

/// Raster operations used by batch jobs and stitch workers.
///
/// Every method is blocking; async callers wrap them in `spawn_blocking`.
pub trait RasterStore: Send + Sync {
    /// Reads georeferencing info.
    fn info(&self, path: &Path) -> Result<RasterInfo, RasterError>;

    /// Creates (or overwrites) an empty mosaic filled with nodata.
    fn create_mosaic(&self, path: &Path, spec: &MosaicSpec) -> Result<(), RasterError>;

    /// Warps `src` into a new raster at `dst`.
    fn warp(&self, src: &Path, dst: &Path, options: &WarpOptions) -> Result<(), RasterError>;

    /// Stitches `inputs`, in order, into the existing mosaic at `mosaic`.
    ///
    /// Nodata source pixels never touch the mosaic. The mosaic is rewritten
    /// once after all inputs are applied.
    fn stitch(
        &self,
        inputs: &[PathBuf],
        mosaic: &Path,
        options: &StitchOptions,
    ) -> Result<(), RasterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mosaic_spec_layout() {
        let spec = MosaicSpec::geographic(BoundingBox::new(-10.0, -5.0, 10.0, 5.0), 0.3);
        assert_eq!(spec.dimensions(), (66, 33));
        assert_eq!(spec.geotransform(), [-10.0, 0.3, 0.0, 5.0, 0.0, -0.3]);
        assert_eq!(spec.epsg, 4326);
        assert_eq!(spec.nodata, -9999.0);
    }

    #[test]
    fn test_overlap_policies() {
        let nodata = -9999.0;
        let mut dst = 2.0;
        OverlapPolicy::Replace.apply(&mut dst, 5.0, nodata);
        assert_eq!(dst, 5.0);

        OverlapPolicy::Add.apply(&mut dst, 1.5, nodata);
        assert_eq!(dst, 6.5);

        let mut empty = nodata;
        OverlapPolicy::Add.apply(&mut empty, 1.5, nodata);
        assert_eq!(empty, 1.5);

        OverlapPolicy::Etch.apply(&mut dst, 9.0, nodata);
        assert_eq!(dst, 6.5);
        let mut empty = nodata;
        OverlapPolicy::Etch.apply(&mut empty, 9.0, nodata);
        assert_eq!(empty, 9.0);
    }

    #[test]
    fn test_info_bounds() {
        let info = RasterInfo {
            width: 4,
            height: 2,
            geotransform: [100.0, 30.0, 0.0, 500.0, 0.0, -30.0],
            epsg: 32633,
            nodata: 0.0,
        };
        assert_eq!(info.bounds(), BoundingBox::new(100.0, 440.0, 220.0, 500.0));
        assert_eq!(info.pixel_size(), (30.0, 30.0));
    }
}
