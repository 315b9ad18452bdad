//! Pixel sampling for warps and stitches.

use std::collections::HashMap;

use crate::geo::{transform_point, Projection};

use super::{is_nodata, GridRaster, ResampleMethod};

/// Samples a source raster at destination pixel locations.
///
/// Destination coordinates are transformed into the source projection before
/// lookup. Returns `None` for positions outside the source or where every
/// contributing source pixel is nodata.
pub(super) struct Sampler<'a> {
    src: &'a GridRaster,
    src_proj: Projection,
    dst_proj: Projection,
    method: ResampleMethod,
}

impl<'a> Sampler<'a> {
    pub(super) fn new(
        src: &'a GridRaster,
        src_proj: Projection,
        dst_proj: Projection,
        method: ResampleMethod,
    ) -> Self {
        Self {
            src,
            src_proj,
            dst_proj,
            method,
        }
    }

    /// Samples the destination pixel whose footprint is
    /// `[x0, x1] x [y0, y1]` (destination coordinates).
    pub(super) fn sample(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> Option<f32> {
        let cx = (x0 + x1) / 2.0;
        let cy = (y0 + y1) / 2.0;
        let (sx, sy) = transform_point(self.dst_proj, self.src_proj, cx, cy);
        match self.method {
            ResampleMethod::Nearest => self.nearest(sx, sy),
            ResampleMethod::Bilinear => self.bilinear(sx, sy),
            ResampleMethod::Mode => self.mode(x0, y0, x1, y1).or_else(|| self.nearest(sx, sy)),
        }
    }

    fn value(&self, col: isize, row: isize) -> Option<f32> {
        if col < 0 || row < 0 {
            return None;
        }
        let (col, row) = (col as usize, row as usize);
        if col >= self.src.width || row >= self.src.height {
            return None;
        }
        let v = self.src.data[row * self.src.width + col];
        (!is_nodata(v, self.src.nodata)).then_some(v)
    }

    fn nearest(&self, x: f64, y: f64) -> Option<f32> {
        let (col, row) = self.src.to_pixel(x, y);
        self.value(col.floor() as isize, row.floor() as isize)
    }

    fn bilinear(&self, x: f64, y: f64) -> Option<f32> {
        let (col, row) = self.src.to_pixel(x, y);
        if col < 0.0 || row < 0.0 || col > self.src.width as f64 || row > self.src.height as f64 {
            return None;
        }
        // pixel centres sit at half-integer positions
        let fc = col - 0.5;
        let fr = row - 0.5;
        let c0 = fc.floor();
        let r0 = fr.floor();
        let tx = fc - c0;
        let ty = fr - r0;
        let max_c = self.src.width as isize - 1;
        let max_r = self.src.height as isize - 1;
        let clamp = |v: f64, max: isize| (v as isize).clamp(0, max);

        let mut sum = 0.0;
        let mut weight = 0.0;
        for (dc, wx) in [(0.0, 1.0 - tx), (1.0, tx)] {
            for (dr, wy) in [(0.0, 1.0 - ty), (1.0, ty)] {
                let w = wx * wy;
                if w <= 0.0 {
                    continue;
                }
                if let Some(v) = self.value(clamp(c0 + dc, max_c), clamp(r0 + dr, max_r)) {
                    sum += v as f64 * w;
                    weight += w;
                }
            }
        }
        (weight > 0.0).then(|| (sum / weight) as f32)
    }

    fn mode(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> Option<f32> {
        let corners = [(x0, y0), (x1, y0), (x0, y1), (x1, y1)];
        let mut min_c = f64::INFINITY;
        let mut min_r = f64::INFINITY;
        let mut max_c = f64::NEG_INFINITY;
        let mut max_r = f64::NEG_INFINITY;
        for (x, y) in corners {
            let (sx, sy) = transform_point(self.dst_proj, self.src_proj, x, y);
            let (c, r) = self.src.to_pixel(sx, sy);
            min_c = min_c.min(c);
            max_c = max_c.max(c);
            min_r = min_r.min(r);
            max_r = max_r.max(r);
        }

        let c_start = min_c.floor().max(0.0) as isize;
        let r_start = min_r.floor().max(0.0) as isize;
        let c_end = (max_c.ceil() as isize).min(self.src.width as isize);
        let r_end = (max_r.ceil() as isize).min(self.src.height as isize);

        let mut counts: HashMap<u32, usize> = HashMap::new();
        for r in r_start..r_end {
            for c in c_start..c_end {
                if let Some(v) = self.value(c, r) {
                    *counts.entry(v.to_bits()).or_insert(0) += 1;
                }
            }
        }
        // ties resolve to the smallest value
        counts
            .into_iter()
            .map(|(bits, n)| (n, f32::from_bits(bits)))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.total_cmp(&a.1)))
            .map(|(_, v)| v)
    }
}
