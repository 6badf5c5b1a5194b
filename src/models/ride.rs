// src/models/ride.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::models::geo::Place;
use crate::models::trip::TripState;
use crate::models::vehicle::VehicleType;

/// A traveller's ask for transportation, prior to rider assignment. Owned by
/// the dispatch coordinator for its active lifetime; terminal records are
/// immutable and eventually archived.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRequest {
    pub id: String,
    pub traveller_id: String,
    pub rider_id: Option<String>,    // null until assigned
    pub pickup: Place,
    pub drop: Place,
    pub requested_vehicle_type: VehicleType,
    pub passenger_count: u8,
    pub status: TripState,
    pub fare_quote: f64,             // quoted at submission, not final
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRequestDraft {
    pub traveller_id: String,
    pub pickup: Place,
    pub drop: Place,
    pub vehicle_type: VehicleType,
    pub passenger_count: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequestResponse {
    pub request_id: String,
    pub status: TripState,
    pub fare_quote: f64,
}

/// Summary of the assigned rider attached to status responses once a match
/// has been made.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssignedRider {
    pub rider_id: String,
    pub name: String,
    pub vehicle_type: VehicleType,
    pub registration_number: String,
    pub rating_average: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestStatusResponse {
    pub request_id: String,
    pub status: TripState,
    pub trip_id: Option<String>,
    pub assigned_rider: Option<AssignedRider>,
    pub fare_quote: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OfferResponseRequest {
    pub request_id: String,
    pub accept: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub actor: crate::models::trip::CancelActor,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitOtpRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitOtpResponse {
    pub verified: bool,
    pub state: TripState,
}

/// Fare quote: flag fall plus a per-kilometre component over the straight
/// line distance. Dynamic pricing is out of scope; the quote is reused as the
/// final fare at completion.
pub fn quote_fare(vehicle_type: VehicleType, pickup: &Place, drop: &Place) -> f64 {
    let distance_km = pickup.point.distance_meters(&drop.point) / 1000.0;
    let raw = vehicle_type.base_fare() + vehicle_type.per_km_fare() * distance_km;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geo::GeoPoint;

    fn place(lat: f64, lng: f64) -> Place {
        Place {
            address: "test".to_string(),
            point: GeoPoint::new(lat, lng),
        }
    }

    #[test]
    fn test_quote_includes_base_fare() {
        let p = place(24.3735, 92.1624);
        let quote = quote_fare(VehicleType::Auto, &p, &p);
        assert_eq!(quote, VehicleType::Auto.base_fare());
    }

    #[test]
    fn test_quote_grows_with_distance() {
        let pickup = place(24.3735, 92.1624);
        let near = place(24.3780, 92.1624);
        let far = place(24.4200, 92.1624);
        let near_quote = quote_fare(VehicleType::Bike, &pickup, &near);
        let far_quote = quote_fare(VehicleType::Bike, &pickup, &far);
        assert!(far_quote > near_quote);
        assert!(near_quote > VehicleType::Bike.base_fare());
    }
}
