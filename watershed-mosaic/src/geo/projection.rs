//! Geographic ↔ UTM projection on the WGS84 ellipsoid.
//!
//! Only the projections the pipeline needs are supported: geographic
//! latitude/longitude (EPSG:4326) and the 120 WGS84 UTM zones
//! (EPSG:326xx north, EPSG:327xx south). The transverse Mercator series are
//! accurate to well under a metre inside a zone, which is far finer than any
//! raster the pipeline aligns.

use super::{BoundingBox, GeoError};

/// EPSG code for geographic WGS84 coordinates.
pub const WGS84_EPSG: u32 = 4326;

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const SCALE_FACTOR: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Number of sample points per box edge when transforming extents.
const EDGE_SAMPLES: usize = 21;

/// A supported coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    /// Longitude/latitude in degrees.
    Geographic,
    /// Universal Transverse Mercator, metres.
    Utm { zone: u8, north: bool },
}

impl Projection {
    /// Resolves an EPSG code.
    pub fn from_epsg(epsg: u32) -> Result<Self, GeoError> {
        match epsg {
            WGS84_EPSG => Ok(Self::Geographic),
            32601..=32660 => Ok(Self::Utm {
                zone: (epsg - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Ok(Self::Utm {
                zone: (epsg - 32700) as u8,
                north: false,
            }),
            other => Err(GeoError::UnsupportedEpsg(other)),
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Self::Geographic => WGS84_EPSG,
            Self::Utm { zone, north: true } => 32600 + *zone as u32,
            Self::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Self::Geographic)
    }

    /// Projects a geographic point into this system.
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Self::Geographic => (lon, lat),
            Self::Utm { zone, north } => utm_forward(lon, lat, *zone, *north),
        }
    }

    /// Converts a point in this system back to geographic coordinates.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Self::Geographic => (x, y),
            Self::Utm { zone, north } => utm_inverse(x, y, *zone, *north),
        }
    }

    /// Ground area in m² of a `width` x `height` pixel centred on `center_y`.
    ///
    /// UTM pixels are taken at face value. Geographic pixels use the area of
    /// the ellipsoid band between the pixel's top and bottom latitudes.
    pub fn pixel_area_m2(&self, width: f64, height: f64, center_y: f64) -> f64 {
        match self {
            Self::Utm { .. } => (width * height).abs(),
            Self::Geographic => {
                let half = height.abs() / 2.0;
                let band = zone_area(center_y + half) - zone_area(center_y - half);
                (width / 360.0 * band).abs()
            }
        }
    }
}

/// Ellipsoid surface area between the equator and `lat`, all longitudes.
fn zone_area(lat: f64) -> f64 {
    let b = SEMI_MAJOR_AXIS * (1.0 - FLATTENING);
    let e = (FLATTENING * (2.0 - FLATTENING)).sqrt();
    let sin = lat.clamp(-90.0, 90.0).to_radians().sin();
    let zm = 1.0 - e * sin;
    let zp = 1.0 + e * sin;
    std::f64::consts::PI * b * b * ((zp / zm).ln() / (2.0 * e) + sin / (zp * zm))
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

fn eccentricity_squared() -> f64 {
    FLATTENING * (2.0 - FLATTENING)
}

fn meridian_arc(phi: f64) -> f64 {
    let e2 = eccentricity_squared();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    SEMI_MAJOR_AXIS
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn utm_forward(lon: f64, lat: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);

    let phi = lat.to_radians();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let n = SEMI_MAJOR_AXIS / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = phi.tan().powi(2);
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lon - central_meridian(zone)).to_radians();
    let m = meridian_arc(phi);

    let x = SCALE_FACTOR
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;

    let mut y = SCALE_FACTOR
        * (m + n
            * phi.tan()
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        y += FALSE_NORTHING_SOUTH;
    }
    (x, y)
}

fn utm_inverse(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let ep2 = e2 / (1.0 - e2);

    let x = x - FALSE_EASTING;
    let y = if north { y } else { y - FALSE_NORTHING_SOUTH };

    let m = y / SCALE_FACTOR;
    let mu = m / (SEMI_MAJOR_AXIS * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin_phi1, cos_phi1) = phi1.sin_cos();
    let n1 = SEMI_MAJOR_AXIS / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = phi1.tan().powi(2);
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = SEMI_MAJOR_AXIS * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * SCALE_FACTOR);

    let phi = phi1
        - (n1 * phi1.tan() / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lambda = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos_phi1;

    (
        central_meridian(zone) + lambda.to_degrees(),
        phi.to_degrees(),
    )
}

/// Transforms a single point between two systems.
#[inline]
pub fn transform_point(from: Projection, to: Projection, x: f64, y: f64) -> (f64, f64) {
    if from == to {
        return (x, y);
    }
    let (lon, lat) = from.inverse(x, y);
    to.forward(lon, lat)
}

/// Transforms an extent between two systems.
///
/// Each edge is densified so the result covers the curved image of the
/// source box, then the envelope of the transformed samples is returned.
pub fn transform_bounding_box(bb: &BoundingBox, from: Projection, to: Projection) -> BoundingBox {
    if from == to {
        return *bb;
    }

    let mut out = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    let steps = (EDGE_SAMPLES - 1) as f64;
    for i in 0..EDGE_SAMPLES {
        let fx = bb.min_x + bb.width() * i as f64 / steps;
        let fy = bb.min_y + bb.height() * i as f64 / steps;
        for (x, y) in [(fx, bb.min_y), (fx, bb.max_y), (bb.min_x, fy), (bb.max_x, fy)] {
            let (tx, ty) = transform_point(from, to, x, y);
            out.min_x = out.min_x.min(tx);
            out.min_y = out.min_y.min(ty);
            out.max_x = out.max_x.max(tx);
            out.max_y = out.max_y.max(ty);
        }
    }
    out
}
