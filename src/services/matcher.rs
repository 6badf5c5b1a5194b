// src/services/matcher.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing;

use crate::errors::DispatchResult;
use crate::models::ride::RideRequest;
use crate::services::geo_index::{GeoIndex, RiderCandidate};

/// Candidate selection for a ride request. Pure ranking and eligibility;
/// the offer protocol, retry cadence and any decline-penalty policy live in
/// the dispatch coordinator.
pub struct Matcher {
    geo_index: Arc<GeoIndex>,
    max_candidates: usize,
}

impl Matcher {
    pub fn new(geo_index: Arc<GeoIndex>, max_candidates: usize) -> Self {
        Self {
            geo_index,
            max_candidates,
        }
    }

    /// Up to `max_candidates` eligible riders for the request, nearest first.
    /// Eligibility is a hard gate: matching vehicle type, capacity covering
    /// the passenger count, online-idle with a fresh heartbeat, and not the
    /// requesting traveller themselves. An empty result is the normal
    /// no-candidates outcome, not an error.
    pub fn find_candidates(
        &self,
        request: &RideRequest,
        radius_meters: f64,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<RiderCandidate>> {
        let nearby = self.geo_index.query_nearby(
            &request.pickup.point,
            radius_meters,
            request.requested_vehicle_type,
            now,
        )?;

        let candidates: Vec<RiderCandidate> = nearby
            .into_iter()
            .filter(|c| c.capacity >= request.passenger_count)
            .filter(|c| c.rider_id != request.traveller_id)
            .take(self.max_candidates)
            .collect();

        tracing::debug!(
            "Matcher found {} candidate(s) for request {} within {:.0}m",
            candidates.len(),
            request.id,
            radius_meters
        );

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geo::{GeoPoint, Place};
    use crate::models::trip::TripState;
    use crate::models::vehicle::{AvailabilityStatus, VehicleType};

    fn request_at(lat: f64, lng: f64, passengers: u8) -> RideRequest {
        RideRequest {
            id: "req-250830-a1b2c".to_string(),
            traveller_id: "usr-250830-trvlr".to_string(),
            rider_id: None,
            pickup: Place {
                address: "pickup".to_string(),
                point: GeoPoint::new(lat, lng),
            },
            drop: Place {
                address: "drop".to_string(),
                point: GeoPoint::new(lat + 0.03, lng),
            },
            requested_vehicle_type: VehicleType::Auto,
            passenger_count: passengers,
            status: TripState::Searching,
            fare_quote: 50.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn add_rider(geo: &GeoIndex, id: &str, lat: f64, lng: f64, capacity: u8) {
        geo.upsert(
            id,
            &format!("veh-{}", id),
            VehicleType::Auto,
            capacity,
            GeoPoint::new(lat, lng),
            AvailabilityStatus::OnlineIdle,
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn test_candidates_ordered_by_distance() {
        let geo = Arc::new(GeoIndex::new(30));
        add_rider(&geo, "usr-250830-rider1", 24.378, 92.165, 4);
        add_rider(&geo, "usr-250830-rider2", 24.390, 92.200, 4);

        let matcher = Matcher::new(geo, 10);
        let request = request_at(24.3735, 92.1624, 2);
        let candidates = matcher.find_candidates(&request, 10_000.0, Utc::now()).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].rider_id, "usr-250830-rider1");
        assert_eq!(candidates[1].rider_id, "usr-250830-rider2");
    }

    #[test]
    fn test_capacity_gate_never_partial() {
        let geo = Arc::new(GeoIndex::new(30));
        add_rider(&geo, "usr-250830-small", 24.374, 92.163, 2);
        add_rider(&geo, "usr-250830-large", 24.380, 92.170, 6);

        let matcher = Matcher::new(geo, 10);
        let request = request_at(24.3735, 92.1624, 4);
        let candidates = matcher.find_candidates(&request, 10_000.0, Utc::now()).unwrap();

        // The closer rider is skipped outright, not offered a partial match
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rider_id, "usr-250830-large");
    }

    #[test]
    fn test_traveller_never_matched_to_self() {
        let geo = Arc::new(GeoIndex::new(30));
        add_rider(&geo, "usr-250830-trvlr", 24.374, 92.163, 4);

        let matcher = Matcher::new(geo, 10);
        let request = request_at(24.3735, 92.1624, 1);
        let candidates = matcher.find_candidates(&request, 10_000.0, Utc::now()).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let geo = Arc::new(GeoIndex::new(30));
        let matcher = Matcher::new(geo, 10);
        let request = request_at(24.3735, 92.1624, 2);
        let candidates = matcher.find_candidates(&request, 2_000.0, Utc::now()).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_result_truncated_to_max_candidates() {
        let geo = Arc::new(GeoIndex::new(30));
        for i in 0..15 {
            add_rider(&geo, &format!("usr-250830-ridr{:02}", i), 24.374 + 0.001 * i as f64, 92.163, 4);
        }

        let matcher = Matcher::new(geo, 10);
        let request = request_at(24.3735, 92.1624, 2);
        let candidates = matcher.find_candidates(&request, 20_000.0, Utc::now()).unwrap();
        assert_eq!(candidates.len(), 10);
    }
}
