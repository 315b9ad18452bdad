//! Grid raster format and the file-based [`RasterStore`].

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::{transform_bounding_box, transform_point, BoundingBox, Projection};

use super::sample::Sampler;
use super::{
    is_nodata, MosaicSpec, RasterError, RasterInfo, RasterStore, ResampleMethod, StitchOptions,
    WarpOptions,
};

/// File extension of grid rasters.
pub const GRID_EXTENSION: &str = "grid";

/// Single-band north-up raster with `f32` cells in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRaster {
    pub width: usize,
    pub height: usize,
    /// `[origin_x, pixel_width, 0, origin_y, 0, -pixel_height]`
    pub geotransform: [f64; 6],
    pub epsg: u32,
    pub nodata: f32,
    pub data: Vec<f32>,
}

impl GridRaster {
    /// Creates a raster filled with `nodata`.
    pub fn filled(width: usize, height: usize, geotransform: [f64; 6], epsg: u32, nodata: f32) -> Self {
        Self {
            width,
            height,
            geotransform,
            epsg,
            nodata,
            data: vec![nodata; width * height],
        }
    }

    pub fn info(&self) -> RasterInfo {
        RasterInfo {
            width: self.width,
            height: self.height,
            geotransform: self.geotransform,
            epsg: self.epsg,
            nodata: self.nodata,
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        self.info().bounds()
    }

    /// Fractional `(column, row)` of a coordinate.
    #[inline]
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let gt = &self.geotransform;
        ((x - gt[0]) / gt[1], (y - gt[3]) / gt[5])
    }

    /// Coordinate of a fractional pixel position.
    #[inline]
    pub fn to_coord(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.geotransform;
        (gt[0] + col * gt[1], gt[3] + row * gt[5])
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        (col < self.width && row < self.height).then(|| self.data[row * self.width + col])
    }

    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        if col < self.width && row < self.height {
            self.data[row * self.width + col] = value;
        }
    }

    /// Count of cells holding data.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !is_nodata(**v, self.nodata)).count()
    }

    /// Loads a raster from file.
    pub fn load(path: &Path) -> Result<Self, RasterError> {
        let file = fs::File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RasterError::NotFound(path.to_path_buf())
            } else {
                RasterError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let raster: GridRaster =
            bincode::deserialize_from(BufReader::new(file)).map_err(|e| RasterError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if raster.data.len() != raster.width * raster.height {
            return Err(RasterError::Decode {
                path: path.to_path_buf(),
                reason: format!(
                    "{} cells for a {}x{} grid",
                    raster.data.len(),
                    raster.width,
                    raster.height
                ),
            });
        }
        Ok(raster)
    }

    /// Saves the raster, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> Result<(), RasterError> {
        let io_err = |source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = temp_path_for(path);
        let file = fs::File::create(&temp_path).map_err(io_err)?;
        bincode::serialize_into(BufWriter::new(file), self).map_err(|e| RasterError::Encode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::rename(&temp_path, path).map_err(io_err)
    }
}

/// `x.grid` becomes `x.grid.tmp`, so siblings differing only in extension
/// never share a temp file.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// [`RasterStore`] over [`GridRaster`] files.
#[derive(Debug, Clone, Default)]
pub struct GridStore;

impl GridStore {
    pub fn new() -> Self {
        Self
    }
}

impl RasterStore for GridStore {
    fn info(&self, path: &Path) -> Result<RasterInfo, RasterError> {
        Ok(GridRaster::load(path)?.info())
    }

    fn create_mosaic(&self, path: &Path, spec: &MosaicSpec) -> Result<(), RasterError> {
        let (width, height) = spec.dimensions();
        if width == 0 || height == 0 {
            return Err(RasterError::EmptyExtent {
                path: path.to_path_buf(),
                bounds: spec.bounds,
            });
        }
        debug!(path = %path.display(), width, height, "Creating mosaic");
        GridRaster::filled(width, height, spec.geotransform(), spec.epsg, spec.nodata).save(path)
    }

    fn warp(&self, src: &Path, dst: &Path, options: &WarpOptions) -> Result<(), RasterError> {
        let source = GridRaster::load(src)?;
        let src_proj = Projection::from_epsg(source.epsg)?;
        let dst_epsg = options.target_epsg.unwrap_or(source.epsg);
        let dst_proj = Projection::from_epsg(dst_epsg)?;

        let bounds = options
            .bounds
            .unwrap_or_else(|| transform_bounding_box(&source.bounds(), src_proj, dst_proj));
        let (px, py) = match options.pixel_size {
            Some(size) => size,
            None if src_proj == dst_proj => source.info().pixel_size(),
            None => {
                let projected = transform_bounding_box(&source.bounds(), src_proj, dst_proj);
                (
                    projected.width() / source.width as f64,
                    projected.height() / source.height as f64,
                )
            }
        };
        let width = (bounds.width() / px).round() as usize;
        let height = (bounds.height() / py).round() as usize;
        if width == 0 || height == 0 || !bounds.is_valid() {
            return Err(RasterError::EmptyExtent {
                path: src.to_path_buf(),
                bounds,
            });
        }

        let mut out = GridRaster::filled(
            width,
            height,
            [bounds.min_x, px, 0.0, bounds.max_y, 0.0, -py],
            dst_epsg,
            source.nodata,
        );
        let method = options.resample.unwrap_or(ResampleMethod::Nearest);
        let sampler = Sampler::new(&source, src_proj, dst_proj, method);
        let mask = match &options.mask {
            Some(subset) => Some((subset.as_ref(), Projection::from_epsg(subset.epsg)?)),
            None => None,
        };
        let gt = out.geotransform;

        out.data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(row, cells)| {
                let y0 = gt[3] + (row + 1) as f64 * gt[5];
                let y1 = gt[3] + row as f64 * gt[5];
                for (col, cell) in cells.iter_mut().enumerate() {
                    let x0 = gt[0] + col as f64 * gt[1];
                    let x1 = x0 + gt[1];
                    if let Some((subset, mask_proj)) = mask {
                        let (mx, my) =
                            transform_point(dst_proj, mask_proj, (x0 + x1) / 2.0, (y0 + y1) / 2.0);
                        if !subset.contains(mx, my) {
                            continue;
                        }
                    }
                    if let Some(v) = sampler.sample(x0, y0, x1, y1) {
                        *cell = v;
                    }
                }
            });

        debug!(
            src = %src.display(),
            dst = %dst.display(),
            width,
            height,
            epsg = dst_epsg,
            "Warped raster"
        );
        out.save(dst)
    }

    fn stitch(
        &self,
        inputs: &[PathBuf],
        mosaic: &Path,
        options: &StitchOptions,
    ) -> Result<(), RasterError> {
        let StitchOptions {
            resample,
            overlap,
            area_weighted,
        } = *options;
        let mut target = GridRaster::load(mosaic)?;
        let dst_proj = Projection::from_epsg(target.epsg)?;

        for input in inputs {
            let source = GridRaster::load(input)?;
            let src_proj = Projection::from_epsg(source.epsg)?;
            let footprint = transform_bounding_box(&source.bounds(), src_proj, dst_proj);
            let Some(window) = footprint.intersection(&target.bounds()) else {
                debug!(input = %input.display(), "Input outside mosaic, skipping");
                continue;
            };

            let (c0, r0) = target.to_pixel(window.min_x, window.max_y);
            let (c1, r1) = target.to_pixel(window.max_x, window.min_y);
            let col_start = c0.floor().max(0.0) as usize;
            let row_start = r0.floor().max(0.0) as usize;
            let col_end = (c1.ceil() as usize).min(target.width);
            let row_end = (r1.ceil() as usize).min(target.height);
            if col_start >= col_end || row_start >= row_end {
                continue;
            }

            let sampler = Sampler::new(&source, src_proj, dst_proj, resample);
            let (src_px, src_py) = source.info().pixel_size();
            let gt = target.geotransform;
            let nodata = target.nodata;
            let width = target.width;
            target
                .data
                .par_chunks_mut(width)
                .enumerate()
                .skip(row_start)
                .take(row_end - row_start)
                .for_each(|(row, cells)| {
                    let y0 = gt[3] + (row + 1) as f64 * gt[5];
                    let y1 = gt[3] + row as f64 * gt[5];
                    for (col, cell) in cells
                        .iter_mut()
                        .enumerate()
                        .skip(col_start)
                        .take(col_end - col_start)
                    {
                        let x0 = gt[0] + col as f64 * gt[1];
                        let Some(mut v) = sampler.sample(x0, y0, x0 + gt[1], y1) else {
                            continue;
                        };
                        if area_weighted {
                            let (cx, cy) = (x0 + gt[1] / 2.0, (y0 + y1) / 2.0);
                            let (_, sy) = transform_point(dst_proj, src_proj, cx, cy);
                            let ratio = dst_proj.pixel_area_m2(gt[1], gt[5], cy)
                                / src_proj.pixel_area_m2(src_px, src_py, sy);
                            v = (v as f64 * ratio) as f32;
                        }
                        overlap.apply(cell, v, nodata);
                    }
                });
        }

        target.save(mosaic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Geometry, Region, RegionSubset};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn geographic(min_x: f64, max_y: f64, px: f64, width: usize, height: usize, value: f32) -> GridRaster {
        let mut raster = GridRaster::filled(width, height, [min_x, px, 0.0, max_y, 0.0, -px], 4326, -9999.0);
        raster.data.iter_mut().for_each(|v| *v = value);
        raster
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("a.grid");
        let raster = geographic(0.0, 1.0, 0.5, 2, 2, 3.0);
        raster.save(&path).unwrap();
        assert_eq!(GridRaster::load(&path).unwrap(), raster);
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_temp_path_keeps_extension() {
        assert_eq!(temp_path_for(Path::new("/w/x.grid")), PathBuf::from("/w/x.grid.tmp"));
        assert_ne!(temp_path_for(Path::new("/w/x.grid")), temp_path_for(Path::new("/w/x.bin")));
    }

    #[test]
    fn test_sibling_saves_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let grid = temp.path().join("x.grid");
        let other = temp.path().join("x.bin");
        let a = geographic(0.0, 1.0, 0.5, 2, 2, 1.0);
        let b = geographic(0.0, 1.0, 0.5, 2, 2, 2.0);

        for _ in 0..20 {
            std::thread::scope(|scope| {
                scope.spawn(|| a.save(&grid).unwrap());
                scope.spawn(|| b.save(&other).unwrap());
            });
        }
        assert_eq!(GridRaster::load(&grid).unwrap(), a);
        assert_eq!(GridRaster::load(&other).unwrap(), b);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let err = GridRaster::load(Path::new("/nonexistent/x.grid")).unwrap_err();
        assert!(matches!(err, RasterError::NotFound(_)));
    }

    #[test]
    fn test_create_mosaic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mosaic.grid");
        let store = GridStore::new();
        let spec = MosaicSpec::geographic(BoundingBox::new(-2.0, -1.0, 2.0, 1.0), 0.5);
        store.create_mosaic(&path, &spec).unwrap();

        let info = store.info(&path).unwrap();
        assert_eq!((info.width, info.height), (8, 4));
        assert_eq!(info.geotransform, [-2.0, 0.5, 0.0, 1.0, 0.0, -0.5]);
        assert_eq!(GridRaster::load(&path).unwrap().valid_count(), 0);
    }

    #[test]
    fn test_warp_clip_native_resolution() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.grid");
        let mut raster = geographic(0.0, 4.0, 1.0, 4, 4, 0.0);
        for (i, v) in raster.data.iter_mut().enumerate() {
            *v = i as f32;
        }
        raster.save(&src).unwrap();

        let dst = temp.path().join("clip.grid");
        let options = WarpOptions::new()
            .with_target_epsg(4326)
            .with_bounds(BoundingBox::new(1.0, 1.0, 3.0, 3.0))
            .with_pixel_size(1.0, 1.0);
        GridStore::new().warp(&src, &dst, &options).unwrap();

        let out = GridRaster::load(&dst).unwrap();
        assert_eq!((out.width, out.height), (2, 2));
        assert_eq!(out.data, vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_warp_to_utm_with_mask() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("dem.grid");
        geographic(14.0, 46.0, 0.01, 100, 100, 7.0).save(&src).unwrap();

        let region = Region::new("c", 1, Geometry::rectangle(14.2, 45.2, 14.4, 45.4)).unwrap();
        let utm = Projection::from_epsg(region.zone_epsg).unwrap();
        let subset = Arc::new(RegionSubset {
            job_id: "c_1".to_string(),
            epsg: region.zone_epsg,
            regions: vec![region.reprojected(Projection::Geographic, utm)],
        });
        let bounds = subset.envelope().unwrap();
        let options = WarpOptions::new()
            .with_target_epsg(subset.epsg)
            .with_bounds(BoundingBox::new(
                bounds.min_x - 2000.0,
                bounds.min_y - 2000.0,
                bounds.max_x + 2000.0,
                bounds.max_y + 2000.0,
            ))
            .with_pixel_size(500.0, 500.0)
            .with_resample(ResampleMethod::Bilinear)
            .with_mask(subset.clone());
        let dst = temp.path().join("aligned.grid");
        GridStore::new().warp(&src, &dst, &options).unwrap();

        let out = GridRaster::load(&dst).unwrap();
        assert_eq!(out.epsg, 32633);
        let valid = out.valid_count();
        assert!(valid > 0 && valid < out.data.len());
        assert!(out
            .data
            .iter()
            .filter(|v| **v != -9999.0)
            .all(|v| (*v - 7.0).abs() < 1e-4));
        // a corner pixel lies outside the mask
        assert_eq!(out.get(0, 0), Some(-9999.0));
    }

    #[test]
    fn test_stitch_last_writer_wins_within_one_call() {
        let temp = TempDir::new().unwrap();
        let store = GridStore::new();
        let mosaic = temp.path().join("mosaic.grid");
        store
            .create_mosaic(&mosaic, &MosaicSpec::geographic(BoundingBox::new(0.0, 0.0, 4.0, 4.0), 1.0))
            .unwrap();

        let first = temp.path().join("first.grid");
        let second = temp.path().join("second.grid");
        geographic(0.0, 4.0, 1.0, 2, 2, 1.0).save(&first).unwrap();
        geographic(1.0, 3.0, 1.0, 2, 2, 2.0).save(&second).unwrap();

        store
            .stitch(&[first, second], &mosaic, &StitchOptions::new())
            .unwrap();

        let out = GridRaster::load(&mosaic).unwrap();
        assert_eq!(out.get(0, 0), Some(1.0));
        // overlapping cell takes the later value
        assert_eq!(out.get(1, 1), Some(2.0));
        assert_eq!(out.get(2, 2), Some(2.0));
        assert_eq!(out.get(3, 3), Some(-9999.0));
        assert_eq!(out.valid_count(), 7);
    }

    #[test]
    fn test_stitch_nodata_source_keeps_mosaic() {
        let temp = TempDir::new().unwrap();
        let store = GridStore::new();
        let mosaic = temp.path().join("mosaic.grid");
        geographic(0.0, 2.0, 1.0, 2, 2, 5.0).save(&mosaic).unwrap();

        let input = temp.path().join("holes.grid");
        let mut holes = geographic(0.0, 2.0, 1.0, 2, 2, 9.0);
        holes.set(0, 0, -9999.0);
        holes.save(&input).unwrap();

        store
            .stitch(&[input], &mosaic, &StitchOptions::new())
            .unwrap();
        let out = GridRaster::load(&mosaic).unwrap();
        assert_eq!(out.data, vec![5.0, 9.0, 9.0, 9.0]);
    }

    fn utm_square(value: f32) -> GridRaster {
        // 10 km square of 500 m pixels around 15°E 45°N
        let mut raster =
            GridRaster::filled(20, 20, [495_000.0, 500.0, 0.0, 4_990_000.0, 0.0, -500.0], 32633, -9999.0);
        raster.data.iter_mut().for_each(|v| *v = value);
        raster
    }

    #[test]
    fn test_stitch_area_weighted_utm_into_geographic() {
        let temp = TempDir::new().unwrap();
        let store = GridStore::new();
        let spec = MosaicSpec::geographic(BoundingBox::new(14.8, 44.8, 15.2, 45.2), 0.01);
        let weighted = temp.path().join("weighted.grid");
        let plain = temp.path().join("plain.grid");
        store.create_mosaic(&weighted, &spec).unwrap();
        store.create_mosaic(&plain, &spec).unwrap();

        let input = temp.path().join("sed_export.grid");
        utm_square(2.0).save(&input).unwrap();

        store
            .stitch(
                std::slice::from_ref(&input),
                &weighted,
                &StitchOptions::new().with_area_weighting(true),
            )
            .unwrap();
        store
            .stitch(&[input], &plain, &StitchOptions::new())
            .unwrap();

        let weighted = GridRaster::load(&weighted).unwrap();
        let plain = GridRaster::load(&plain).unwrap();
        let (col, row) = weighted.to_pixel(15.005, 45.005);
        let (col, row) = (col as usize, row as usize);
        let center_lat = weighted.geotransform[3] + (row as f64 + 0.5) * weighted.geotransform[5];
        let expected = 2.0 * Projection::Geographic.pixel_area_m2(0.01, 0.01, center_lat) / 250_000.0;

        let value = weighted.get(col, row).unwrap() as f64;
        assert!((value - expected).abs() < 1e-4, "{value} vs {expected}");
        // a 0.01° pixel at 45°N covers about 3.5 UTM pixels
        assert!((value - 7.0).abs() < 0.1, "{value}");
        assert_eq!(plain.get(col, row), Some(2.0));

        // outside the source footprint nothing is written
        assert_eq!(weighted.get(0, 0), Some(-9999.0));
        assert_eq!(weighted.valid_count(), plain.valid_count());
    }
}
