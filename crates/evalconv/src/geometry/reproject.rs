//! Reprojection of package geometries into the fixed WGS84 target.
//!
//! Failures are per-polygon so the caller can drop a bad feature and keep
//! the rest of the package.

use geo::{Coord, MapCoords, Polygon};

use crate::error::GeometryError;

/// Every converted evaluation ends up in WGS84.
pub const TARGET_SRS: i64 = 4326;

const WEB_MERCATOR_SRS: i64 = 3857;

/// Spherical Mercator earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Reprojects one polygon from the package's spatial reference into WGS84.
///
/// SRS 0 and -1 mean "undefined" in a GeoPackage and are taken as WGS84
/// already. Anything other than WGS84 or Web Mercator is refused.
pub fn to_wgs84(polygon: &Polygon<f64>, srs: i64) -> Result<Polygon<f64>, GeometryError> {
    match srs {
        TARGET_SRS | 0 | -1 => {
            check_degrees(polygon, srs)?;
            Ok(polygon.clone())
        }
        WEB_MERCATOR_SRS => polygon.try_map_coords(inverse_mercator),
        other => Err(GeometryError::UnsupportedSrs(other)),
    }
}

fn check_degrees(polygon: &Polygon<f64>, srs: i64) -> Result<(), GeometryError> {
    for line in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
        for coord in &line.0 {
            let in_range = coord.x.is_finite()
                && coord.y.is_finite()
                && coord.x.abs() <= 180.0
                && coord.y.abs() <= 90.0;
            if !in_range {
                return Err(GeometryError::CoordinateOutOfRange {
                    srs,
                    x: coord.x,
                    y: coord.y,
                });
            }
        }
    }
    Ok(())
}

fn inverse_mercator(coord: Coord<f64>) -> Result<Coord<f64>, GeometryError> {
    let max_extent = std::f64::consts::PI * EARTH_RADIUS_M;
    let in_range =
        coord.x.is_finite() && coord.y.is_finite() && coord.x.abs() <= max_extent + 1.0;
    if !in_range {
        return Err(GeometryError::CoordinateOutOfRange {
            srs: WEB_MERCATOR_SRS,
            x: coord.x,
            y: coord.y,
        });
    }
    Ok(Coord {
        x: (coord.x / EARTH_RADIUS_M).to_degrees(),
        y: (coord.y / EARTH_RADIUS_M).sinh().atan().to_degrees(),
    })
}
