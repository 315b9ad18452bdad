//! Geographic extent utilities.
//!
//! Provides the axis-aligned [`BoundingBox`] used throughout the pipeline,
//! list merges (intersection / union), the local projection zone lookup for a
//! region centroid, and extent transforms between geographic and UTM
//! coordinates (see [`projection`]).

mod projection;

pub use projection::{transform_bounding_box, transform_point, Projection, WGS84_EPSG};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by extent and projection helpers.
#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    /// The EPSG code is not a geographic or UTM (WGS84) code.
    #[error("unsupported EPSG code: {0}")]
    UnsupportedEpsg(u32),

    /// Merging boxes by intersection produced an empty extent.
    #[error("bounding boxes do not intersect")]
    EmptyIntersection,

    /// A merge was requested over an empty list.
    #[error("cannot merge an empty list of bounding boxes")]
    EmptyList,
}

/// Axis-aligned extent as `min_x, min_y, max_x, max_y`.
///
/// In geographic coordinates `x` is longitude and `y` is latitude, both in
/// degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Creates a box from its corners.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Creates a box from `[min_x, min_y, max_x, max_y]`.
    pub fn from_array(bb: [f64; 4]) -> Self {
        Self::new(bb[0], bb[1], bb[2], bb[3])
    }

    /// Returns `[min_x, min_y, max_x, max_y]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Returns true if the box has non-negative width and height.
    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    /// Intersection of two boxes, or `None` when they are disjoint.
    ///
    /// Boxes sharing only an edge intersect in a zero-area box.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let merged = BoundingBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        merged.is_valid().then_some(merged)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }

    /// Smallest box covering both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Returns true if `other` lies entirely inside this box (edges included).
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}]",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Intersects every box in the list.
///
/// # Errors
///
/// Returns [`GeoError::EmptyList`] for an empty slice and
/// [`GeoError::EmptyIntersection`] when the boxes share no area.
pub fn intersect_all(boxes: &[BoundingBox]) -> Result<BoundingBox, GeoError> {
    let (first, rest) = boxes.split_first().ok_or(GeoError::EmptyList)?;
    rest.iter().try_fold(*first, |acc, bb| {
        acc.intersection(bb).ok_or(GeoError::EmptyIntersection)
    })
}

/// Unions every box in the list.
pub fn union_all(boxes: &[BoundingBox]) -> Result<BoundingBox, GeoError> {
    let (first, rest) = boxes.split_first().ok_or(GeoError::EmptyList)?;
    Ok(rest.iter().fold(*first, |acc, bb| acc.union(bb)))
}

/// EPSG code of the UTM zone containing a geographic point.
///
/// Northern hemisphere zones are `326xx`, southern (and equator) `327xx`.
#[inline]
pub fn utm_epsg(lon: f64, lat: f64) -> u32 {
    let zone = (((lon + 180.0) / 6.0).floor() as i64).rem_euclid(60) as u32 + 1;
    let hemisphere = if lat > 0.0 { 32600 } else { 32700 };
    hemisphere + zone
}
