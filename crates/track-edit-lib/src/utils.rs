//! Utility functions for coordinate conversions and planar geometry

use geo::{Coord, Point};

/// Web Mercator bounds in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;
pub const EARTH_MERCATOR_MIN: f64 = -20037508.34;
pub const EARTH_SIZE_METERS: f64 = EARTH_MERCATOR_MAX - EARTH_MERCATOR_MIN;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6371000.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / 180.0
const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / PI
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Convert WGS84 (lat, lon) to Web Mercator (x, y) in meters
///
/// # Arguments
/// * `lat` - Latitude in degrees (-85.05 to 85.05)
/// * `lon` - Longitude in degrees (-180 to 180)
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let x = lon * LON_TO_X_FACTOR;
    let lat_rad = lat.to_radians();
    let y = (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() * Y_FACTOR;

    Point::new(x, y)
}

/// Project a run of (lat, lon) pairs onto a plane whose unit is roughly one
/// ground meter around the run.
///
/// Web Mercator inflates distances by `1 / cos(lat)`; the run is rescaled by
/// the cosine of its mean latitude so simplification tolerances can be
/// expressed in meters.
pub fn project_local<I>(lat_lon: I) -> Vec<Coord<f64>>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let projected: Vec<(f64, Point<f64>)> = lat_lon
        .into_iter()
        .map(|(lat, lon)| (lat, wgs84_to_mercator(lat, lon)))
        .collect();
    if projected.is_empty() {
        return Vec::new();
    }

    let mean_lat = projected.iter().map(|(lat, _)| lat).sum::<f64>() / projected.len() as f64;
    let scale = mean_lat
        .clamp(-MAX_LATITUDE, MAX_LATITUDE)
        .to_radians()
        .cos();

    projected
        .into_iter()
        .map(|(_, p)| Coord {
            x: p.x() * scale,
            y: p.y() * scale,
        })
        .collect()
}

/// Calculate the Haversine distance between two (lat, lon) positions in meters
#[inline]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Distance from `p` to the infinite line through `a` and `b`.
///
/// Falls back to the point distance when the chord is degenerate.
#[inline]
pub fn perpendicular_distance(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    let chord = b - a;
    let length = chord.x.hypot(chord.y);
    let offset = p - a;
    if length == 0.0 {
        return offset.x.hypot(offset.y);
    }
    (chord.x * offset.y - chord.y * offset.x).abs() / length
}
