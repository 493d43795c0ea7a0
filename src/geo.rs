//! Great-circle distance and angle conversion.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    /// Build a point, rejecting anything outside lat [-90, 90] / lng [-180, 180].
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(EngineError::InvalidCoordinate { lat: self.lat, lng: self.lng })
        }
    }

    /// Planar distance in degrees. Only meant for coarse grouping.
    pub fn degree_distance(&self, other: &Coordinates) -> f64 {
        (self.lat - other.lat).hypot(self.lng - other.lng)
    }
}

pub fn deg_to_rad(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

pub fn rad_to_deg(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

/// Central angle in degrees spanned by `km` along a great circle.
pub fn arc_degrees(km: f64) -> f64 {
    rad_to_deg(km / EARTH_RADIUS_KM)
}

/// Haversine distance between two points in kilometres.
///
/// Symmetric in its arguments and exactly zero for identical points.
pub fn distance_km(a: &Coordinates, b: &Coordinates) -> Result<f64> {
    a.validate()?;
    b.validate()?;
    if a == b {
        return Ok(0.0);
    }
    let d_lat = deg_to_rad(b.lat - a.lat);
    let d_lng = deg_to_rad(b.lng - a.lng);
    let h = (d_lat / 2.0).sin().powi(2)
        + deg_to_rad(a.lat).cos() * deg_to_rad(b.lat).cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();
    Ok(EARTH_RADIUS_KM * c)
}
