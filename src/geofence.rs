//! Geofence boundaries

use serde::Deserialize;

use crate::errors::FencewatchError;

/// Mean earth radius in metres
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Containment test over a statically configured region.
///
/// Coordinates are WGS84 decimal degrees and are expected to be validated
/// by the caller.
pub trait Geofence: Send + Sync {
    fn is_inside(&self, longitude: f64, latitude: f64) -> bool;
}

/// Region within `radius_m` metres of a center point
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircleGeofence {
    pub center_lon: f64,
    pub center_lat: f64,
    pub radius_m: f64,
}

impl CircleGeofence {
    /// Great-circle distance from the center, in metres
    pub fn distance_m(&self, longitude: f64, latitude: f64) -> f64 {
        let (lat1, lat2) = (self.center_lat.to_radians(), latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (longitude - self.center_lon).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

impl Geofence for CircleGeofence {
    fn is_inside(&self, longitude: f64, latitude: f64) -> bool {
        self.distance_m(longitude, latitude) <= self.radius_m
    }
}

/// Simple polygon given as `[lon, lat]` vertices
///
/// The ring is closed implicitly. Points on an edge may fall either way.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolygonGeofence {
    pub vertices: Vec<[f64; 2]>,
}

impl Geofence for PolygonGeofence {
    fn is_inside(&self, longitude: f64, latitude: f64) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }

        // Even-odd ray casting towards +lon
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.vertices[i];
            let [xj, yj] = self.vertices[j];
            if (yi > latitude) != (yj > latitude)
                && longitude < (xj - xi) * (latitude - yi) / (yj - yi) + xi
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Boundary as read from configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Boundary {
    Circle(CircleGeofence),
    Polygon(PolygonGeofence),
}

impl Boundary {
    /// Validate the boundary definition
    pub fn validate(&self) -> Result<(), FencewatchError> {
        let invalid = |message: &str| FencewatchError::ConfigurationError {
            message: message.to_string(),
        };

        match self {
            Boundary::Circle(circle) => {
                if !valid_point(circle.center_lon, circle.center_lat) {
                    return Err(invalid("Geofence center is not a valid coordinate"));
                }
                if !(circle.radius_m.is_finite() && circle.radius_m > 0.0) {
                    return Err(invalid("Geofence radius must be greater than zero"));
                }
            }
            Boundary::Polygon(polygon) => {
                if polygon.vertices.len() < 3 {
                    return Err(invalid("Geofence polygon needs at least three vertices"));
                }
                if !polygon.vertices.iter().all(|[lon, lat]| valid_point(*lon, *lat)) {
                    return Err(invalid("Geofence polygon has an invalid vertex"));
                }
            }
        }
        Ok(())
    }
}

impl Geofence for Boundary {
    fn is_inside(&self, longitude: f64, latitude: f64) -> bool {
        match self {
            Boundary::Circle(circle) => circle.is_inside(longitude, latitude),
            Boundary::Polygon(polygon) => polygon.is_inside(longitude, latitude),
        }
    }
}

fn valid_point(longitude: f64, latitude: f64) -> bool {
    (-180.0..=180.0).contains(&longitude) && (-90.0..=90.0).contains(&latitude)
}
