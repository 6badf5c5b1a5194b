// src/models/vehicle.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::models::geo::GeoPoint;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleType {
    Bike,
    Auto,
    ERickshaw,
    Car,
}

impl VehicleType {
    /// Typical seating for a registered vehicle of this type.
    pub fn typical_capacity(&self) -> u8 {
        match self {
            VehicleType::Bike => 1,
            VehicleType::Auto => 4,
            VehicleType::ERickshaw => 5,
            VehicleType::Car => 4,
        }
    }

    /// Hard ceiling for the type; a request above this is rejected outright,
    /// before any rider search.
    pub fn max_capacity(&self) -> u8 {
        match self {
            VehicleType::Bike => 1,
            VehicleType::Auto => 6,
            VehicleType::ERickshaw => 5,
            VehicleType::Car => 4,
        }
    }

    /// Flag-fall component of the fare quote, in rupees.
    pub fn base_fare(&self) -> f64 {
        match self {
            VehicleType::Bike => 15.0,
            VehicleType::ERickshaw => 20.0,
            VehicleType::Auto => 30.0,
            VehicleType::Car => 60.0,
        }
    }

    /// Per-kilometre component of the fare quote, in rupees.
    pub fn per_km_fare(&self) -> f64 {
        match self {
            VehicleType::Bike => 8.0,
            VehicleType::ERickshaw => 10.0,
            VehicleType::Auto => 12.0,
            VehicleType::Car => 15.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceStatus {
    Verified,
    ActionRequired,
    Suspended,
}

/// A rider's registered vehicle. A rider owns at most one active vehicle;
/// only Verified vehicles may take trips.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Vehicle {
    pub id: String,
    pub owner_id: String,        // User with role Rider
    pub vehicle_type: VehicleType,
    pub capacity: u8,
    pub registration_number: String,
    pub compliance_status: ComplianceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    Offline,
    OnlineIdle,
    OnlineOnTrip,
}

/// Live availability record, mutated only by the owning rider's heartbeats
/// and by trip assignment/completion. The Geo-Index treats entries with a
/// stale heartbeat as Offline even before an explicit update arrives.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RiderAvailability {
    pub rider_id: String,
    pub vehicle_id: String,
    pub position: GeoPoint,
    pub status: AvailabilityStatus,
    pub last_heartbeat_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize)]
pub struct RiderRegistration {
    pub user_id: String,
    pub vehicle_type: VehicleType,
    pub capacity: Option<u8>,    // defaults to the type's typical capacity
    pub registration_number: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub position: GeoPoint,
    pub status: AvailabilityStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RiderResponse {
    pub rider_id: String,
    pub vehicle: Vehicle,
    pub status: AvailabilityStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_capacities() {
        assert_eq!(VehicleType::Bike.max_capacity(), 1);
        assert_eq!(VehicleType::Auto.max_capacity(), 6);
        assert_eq!(VehicleType::ERickshaw.max_capacity(), 5);
        assert_eq!(VehicleType::Car.max_capacity(), 4);
        for vt in [VehicleType::Bike, VehicleType::Auto, VehicleType::ERickshaw, VehicleType::Car] {
            assert!(vt.typical_capacity() <= vt.max_capacity());
        }
    }

    #[test]
    fn test_fare_components_positive() {
        for vt in [VehicleType::Bike, VehicleType::Auto, VehicleType::ERickshaw, VehicleType::Car] {
            assert!(vt.base_fare() > 0.0);
            assert!(vt.per_km_fare() > 0.0);
        }
    }
}
