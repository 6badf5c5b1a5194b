// src/models/geo.rs
use serde::{Deserialize, Serialize};

/// WGS84 coordinate pair. All positions in the coordinator use this shape;
/// handlers validate it once at the boundary so the services can trust it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine distance in meters.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

        EARTH_RADIUS_M * c
    }
}

/// A named location: free-form address plus coordinates.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Place {
    pub address: String,
    pub point: GeoPoint,
}
