//! Watershed regions and their geometry.
//!
//! A [`Region`] is one polygon feature read from a region collection. Its
//! derived attributes (area, centroid, envelope and local projection zone) are
//! computed once when the region is built and never change afterwards.
//!
//! Collections and region subsets are read and written through the
//! [`RegionStore`] trait; [`JsonRegionStore`] is the file-based
//! implementation used by the CLI.

mod store;

pub use store::{JsonRegionStore, RegionStore, SUBSET_EXTENSION};

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{self, BoundingBox, GeoError, Projection};

/// Stable feature identifier within a collection.
pub type RegionId = u64;

/// One polygon as a list of rings: the exterior ring first, then holes.
pub type PolygonRings = Vec<Vec<[f64; 2]>>;

/// Errors raised while reading or writing regions.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid geometry for feature {id} in {collection}: {reason}")]
    InvalidGeometry {
        collection: String,
        id: RegionId,
        reason: String,
    },

    #[error("failed to list collections in {dir}: {reason}")]
    List { dir: PathBuf, reason: String },

    #[error(transparent)]
    Projection(#[from] GeoError),
}

/// Multi-part polygon geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub polygons: Vec<PolygonRings>,
}

impl Geometry {
    pub fn new(polygons: Vec<PolygonRings>) -> Self {
        Self { polygons }
    }

    /// Axis-aligned rectangle, handy for fixtures.
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(vec![vec![vec![
            [min_x, min_y],
            [max_x, min_y],
            [max_x, max_y],
            [min_x, max_y],
            [min_x, min_y],
        ]]])
    }

    /// Planar area: exterior rings minus holes.
    pub fn area(&self) -> f64 {
        self.polygons
            .iter()
            .map(|rings| {
                let mut iter = rings.iter();
                let exterior = iter.next().map(|r| signed_area(r).abs()).unwrap_or(0.0);
                let holes: f64 = iter.map(|r| signed_area(r).abs()).sum();
                exterior - holes
            })
            .sum()
    }

    /// Area-weighted centroid, or `None` for a degenerate geometry.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let mut sum_a = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for rings in &self.polygons {
            for (index, ring) in rings.iter().enumerate() {
                // holes subtract regardless of winding
                let a = signed_area(ring);
                let sign = if index == 0 { 1.0 } else { -1.0 };
                let (cx, cy) = ring_moment(ring);
                sum_a += sign * a.abs();
                sum_x += sign * a.signum() * cx;
                sum_y += sign * a.signum() * cy;
            }
        }
        if sum_a.abs() < f64::EPSILON {
            return None;
        }
        Some((sum_x / (6.0 * sum_a), sum_y / (6.0 * sum_a)))
    }

    /// Envelope of every vertex, or `None` when there are no vertices.
    pub fn envelope(&self) -> Option<BoundingBox> {
        let mut points = self.polygons.iter().flatten().flatten();
        let first = points.next()?;
        let mut bb = BoundingBox::new(first[0], first[1], first[0], first[1]);
        for p in points {
            bb.min_x = bb.min_x.min(p[0]);
            bb.min_y = bb.min_y.min(p[1]);
            bb.max_x = bb.max_x.max(p[0]);
            bb.max_y = bb.max_y.max(p[1]);
        }
        Some(bb)
    }

    /// Even-odd point-in-polygon test across every ring.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        for ring in self.polygons.iter().flatten() {
            let n = ring.len();
            if n < 3 {
                continue;
            }
            let mut j = n - 1;
            for i in 0..n {
                let (xi, yi) = (ring[i][0], ring[i][1]);
                let (xj, yj) = (ring[j][0], ring[j][1]);
                if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                    inside = !inside;
                }
                j = i;
            }
        }
        inside
    }

    /// Transforms every vertex into another projection.
    pub fn transform(&self, from: Projection, to: Projection) -> Geometry {
        let polygons = self
            .polygons
            .iter()
            .map(|rings| {
                rings
                    .iter()
                    .map(|ring| {
                        ring.iter()
                            .map(|p| {
                                let (x, y) = geo::transform_point(from, to, p[0], p[1]);
                                [x, y]
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Geometry::new(polygons)
    }
}

fn signed_area(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        twice += a[0] * b[1] - b[0] * a[1];
    }
    twice / 2.0
}

/// First moments of a ring (unnormalised centroid numerators).
fn ring_moment(ring: &[[f64; 2]]) -> (f64, f64) {
    let n = ring.len();
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        let cross = a[0] * b[1] - b[0] * a[1];
        cx += (a[0] + b[0]) * cross;
        cy += (a[1] + b[1]) * cross;
    }
    (cx, cy)
}

/// A watershed feature with its derived attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Feature id, unique within its collection.
    pub id: RegionId,
    /// Name of the source collection.
    pub collection: String,
    pub geometry: Geometry,
    /// Area in squared units of the geometry's coordinate system.
    pub area: f64,
    pub centroid: (f64, f64),
    pub envelope: BoundingBox,
    /// UTM EPSG code of the zone containing the geographic centroid.
    pub zone_epsg: u32,
}

impl Region {
    /// Builds a region from geographic geometry.
    ///
    /// # Errors
    ///
    /// Fails with [`RegionError::InvalidGeometry`] when the geometry has no
    /// vertices or zero area.
    pub fn new(
        collection: impl Into<String>,
        id: RegionId,
        geometry: Geometry,
    ) -> Result<Self, RegionError> {
        let collection = collection.into();
        let invalid = |reason: &str| RegionError::InvalidGeometry {
            collection: collection.clone(),
            id,
            reason: reason.to_string(),
        };
        let envelope = geometry.envelope().ok_or_else(|| invalid("no vertices"))?;
        let centroid = geometry.centroid().ok_or_else(|| invalid("zero area"))?;
        let area = geometry.area();
        let zone_epsg = geo::utm_epsg(centroid.0, centroid.1);
        Ok(Self {
            id,
            collection,
            geometry,
            area,
            centroid,
            envelope,
            zone_epsg,
        })
    }

    /// Copy of this region with its geometry projected into `to`.
    ///
    /// Area, centroid and envelope are recomputed in the target units; the
    /// projection zone is kept.
    pub fn reprojected(&self, from: Projection, to: Projection) -> Region {
        let geometry = self.geometry.transform(from, to);
        let envelope = geometry.envelope().unwrap_or(self.envelope);
        let centroid = geometry.centroid().unwrap_or(self.centroid);
        Region {
            id: self.id,
            collection: self.collection.clone(),
            area: geometry.area(),
            centroid,
            envelope,
            zone_epsg: self.zone_epsg,
            geometry,
        }
    }
}

/// All regions of one source collection.
#[derive(Debug, Clone)]
pub struct RegionCollection {
    pub name: String,
    pub regions: Vec<Region>,
    index: HashMap<RegionId, usize>,
}

impl RegionCollection {
    pub fn new(name: impl Into<String>, regions: Vec<Region>) -> Self {
        let index = regions
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
        Self {
            name: name.into(),
            regions,
            index,
        }
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.index.get(&id).map(|&i| &self.regions[i])
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Regions of one job batch, projected into the batch's target projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSubset {
    pub job_id: String,
    /// EPSG code of the subset geometry.
    pub epsg: u32,
    pub regions: Vec<Region>,
}

impl RegionSubset {
    /// Envelope of every member in the subset's own projection.
    pub fn envelope(&self) -> Option<BoundingBox> {
        let boxes: Vec<BoundingBox> = self.regions.iter().map(|r| r.envelope).collect();
        geo::union_all(&boxes).ok()
    }

    /// Envelope of every member in geographic coordinates.
    pub fn geographic_envelope(&self) -> Result<Option<BoundingBox>, GeoError> {
        let projection = Projection::from_epsg(self.epsg)?;
        Ok(self
            .envelope()
            .map(|bb| geo::transform_bounding_box(&bb, projection, Projection::Geographic)))
    }

    /// True when any member polygon contains the point (subset projection).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.regions
            .iter()
            .any(|r| r.envelope.contains_point(x, y) && r.geometry.contains(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_area_and_centroid() {
        let geom = Geometry::rectangle(0.0, 0.0, 2.0, 1.0);
        assert!((geom.area() - 2.0).abs() < 1e-12);
        let (cx, cy) = geom.centroid().unwrap();
        assert!((cx - 1.0).abs() < 1e-12);
        assert!((cy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_clockwise_ring_has_positive_area() {
        let geom = Geometry::new(vec![vec![vec![
            [0.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [1.0, 0.0],
            [0.0, 0.0],
        ]]]);
        assert!((geom.area() - 1.0).abs() < 1e-12);
        let (cx, cy) = geom.centroid().unwrap();
        assert!((cx - 0.5).abs() < 1e-12 && (cy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_hole_subtracts_area() {
        let geom = Geometry::new(vec![vec![
            vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]],
            vec![[1.0, 1.0], [2.0, 1.0], [2.0, 2.0], [1.0, 2.0], [1.0, 1.0]],
        ]]);
        assert!((geom.area() - 15.0).abs() < 1e-12);
        assert!(!geom.contains(1.5, 1.5));
        assert!(geom.contains(3.0, 3.0));
    }

    #[test]
    fn test_multi_part_centroid() {
        let mut geom = Geometry::rectangle(0.0, 0.0, 1.0, 1.0);
        geom.polygons
            .extend(Geometry::rectangle(9.0, 0.0, 10.0, 1.0).polygons);
        let (cx, _) = geom.centroid().unwrap();
        assert!((cx - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_region_derived_fields() {
        let region = Region::new("hybas_af", 7, Geometry::rectangle(10.0, 40.0, 11.0, 41.0)).unwrap();
        assert_eq!(region.envelope, BoundingBox::new(10.0, 40.0, 11.0, 41.0));
        assert_eq!(region.zone_epsg, 32632);
        assert!((region.area - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_region_rejects_empty_geometry() {
        let err = Region::new("c", 1, Geometry::new(vec![])).unwrap_err();
        assert!(matches!(err, RegionError::InvalidGeometry { id: 1, .. }));
    }

    #[test]
    fn test_subset_geographic_envelope_roundtrip() {
        let region = Region::new("c", 1, Geometry::rectangle(14.0, 45.0, 15.0, 46.0)).unwrap();
        let utm = Projection::from_epsg(region.zone_epsg).unwrap();
        let subset = RegionSubset {
            job_id: "c_1".to_string(),
            epsg: region.zone_epsg,
            regions: vec![region.reprojected(Projection::Geographic, utm)],
        };
        let bb = subset.geographic_envelope().unwrap().unwrap();
        assert!((bb.min_x - 14.0).abs() < 1e-3);
        assert!((bb.max_y - 46.0).abs() < 1e-3);
    }

    #[test]
    fn test_collection_lookup() {
        let regions = vec![
            Region::new("c", 3, Geometry::rectangle(0.0, 0.0, 1.0, 1.0)).unwrap(),
            Region::new("c", 9, Geometry::rectangle(1.0, 0.0, 2.0, 1.0)).unwrap(),
        ];
        let collection = RegionCollection::new("c", regions);
        assert_eq!(collection.get(9).unwrap().id, 9);
        assert!(collection.get(4).is_none());
        assert_eq!(collection.len(), 2);
    }
}
