// src/services/rider_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::user::UserRole,
    models::vehicle::{
        AvailabilityStatus, ComplianceStatus, HeartbeatRequest, RiderAvailability,
        RiderRegistration, RiderResponse, Vehicle,
    },
    services::{geo_index::GeoIndex, store::EntityStore},
    utils::id_generator::{IdType, WithGeneratedId},
};

#[async_trait]
pub trait RiderOperations: Send + Sync {
    async fn register_rider(&self, registration: RiderRegistration) -> DispatchResult<RiderResponse>;
    async fn apply_heartbeat(&self, rider_id: &str, heartbeat: HeartbeatRequest) -> DispatchResult<RiderResponse>;
    async fn set_on_trip(&self, rider_id: &str, on_trip: bool) -> DispatchResult<()>;
    async fn availability(&self, rider_id: &str) -> DispatchResult<Option<RiderAvailability>>;
}

pub struct RiderService {
    store: Arc<EntityStore>,
    geo_index: Arc<GeoIndex>,
}

impl RiderService {
    pub fn new(store: Arc<EntityStore>, geo_index: Arc<GeoIndex>) -> Self {
        Self { store, geo_index }
    }

    async fn require_rider_vehicle(&self, rider_id: &str) -> DispatchResult<Vehicle> {
        self.store
            .vehicle_by_owner(rider_id)
            .await?
            .ok_or_else(|| DispatchError::rider_not_found(rider_id))
    }

    /// Write the availability record and mirror it into the geo index in one
    /// step so queries never see the two out of sync for long.
    async fn publish_availability(
        &self,
        availability: &RiderAvailability,
        vehicle: &Vehicle,
    ) -> DispatchResult<()> {
        self.store.put_availability(availability).await?;
        self.geo_index.upsert(
            &availability.rider_id,
            &availability.vehicle_id,
            vehicle.vehicle_type,
            vehicle.capacity,
            availability.position,
            availability.status,
            availability.last_heartbeat_at,
        )?;
        Ok(())
    }
}

#[async_trait]
impl RiderOperations for RiderService {
    async fn register_rider(&self, registration: RiderRegistration) -> DispatchResult<RiderResponse> {
        tracing::info!("Registering rider {} with vehicle", registration.user_id);

        let user = self
            .store
            .get_user(&registration.user_id)
            .await?
            .ok_or_else(|| DispatchError::user_not_found(&registration.user_id))?;
        if user.role != UserRole::Rider {
            return Err(DispatchError::validation_error(
                "user_id",
                "Only users in the RIDER role can register a vehicle",
            ));
        }
        if self.store.vehicle_by_owner(&user.id).await?.is_some() {
            return Err(DispatchError::validation_error(
                "user_id",
                "Rider already has an active vehicle",
            ));
        }
        if registration.registration_number.trim().is_empty() {
            return Err(DispatchError::validation_error(
                "registration_number",
                "Registration number must not be empty",
            ));
        }

        let capacity = registration
            .capacity
            .unwrap_or_else(|| registration.vehicle_type.typical_capacity());
        if capacity == 0 || capacity > registration.vehicle_type.max_capacity() {
            return Err(DispatchError::validation_error(
                "capacity",
                format!(
                    "Capacity must be between 1 and {} for this vehicle type",
                    registration.vehicle_type.max_capacity()
                ),
            ));
        }

        let mut vehicle = Vehicle {
            id: String::new(),
            owner_id: user.id.clone(),
            vehicle_type: registration.vehicle_type,
            capacity,
            registration_number: registration.registration_number.trim().to_string(),
            compliance_status: ComplianceStatus::Verified,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        vehicle.set_generated_id(IdType::Vehicle);
        self.store.put_vehicle(&vehicle).await?;

        tracing::info!("Rider {} registered vehicle {}", user.id, vehicle.id);
        Ok(RiderResponse {
            rider_id: user.id,
            vehicle,
            status: AvailabilityStatus::Offline,
        })
    }

    async fn apply_heartbeat(&self, rider_id: &str, heartbeat: HeartbeatRequest) -> DispatchResult<RiderResponse> {
        if !heartbeat.position.is_valid() {
            return Err(DispatchError::validation_error(
                "position",
                "Latitude/longitude out of range",
            ));
        }

        // Unknown rider id is an auth failure, not a validation one: only
        // registered riders hold heartbeat credentials. Store failures keep
        // their own classification so retry logic still sees them.
        let vehicle = self.require_rider_vehicle(rider_id).await.map_err(|e| match e {
            DispatchError::RiderNotFound(_) => {
                DispatchError::unauthorized(format!("Unknown rider: {}", rider_id))
            }
            other => other,
        })?;

        let on_trip = self.store.active_trip_for_rider(rider_id).await?.is_some();
        let status = if on_trip {
            // An active trip pins the status; heartbeats only move the position.
            AvailabilityStatus::OnlineOnTrip
        } else {
            match heartbeat.status {
                AvailabilityStatus::OnlineOnTrip => {
                    return Err(DispatchError::validation_error(
                        "status",
                        "ONLINE_ON_TRIP is set by trip assignment, not by heartbeat",
                    ));
                }
                requested => requested,
            }
        };

        if status != AvailabilityStatus::Offline
            && vehicle.compliance_status != ComplianceStatus::Verified
        {
            return Err(DispatchError::validation_error(
                "status",
                "Vehicle compliance must be VERIFIED to go online",
            ));
        }

        let availability = RiderAvailability {
            rider_id: rider_id.to_string(),
            vehicle_id: vehicle.id.clone(),
            position: heartbeat.position,
            status,
            last_heartbeat_at: Utc::now(),
        };
        self.publish_availability(&availability, &vehicle).await?;

        tracing::debug!(
            "Heartbeat from {}: {:?} at ({:.4}, {:.4})",
            rider_id,
            status,
            heartbeat.position.latitude,
            heartbeat.position.longitude
        );
        Ok(RiderResponse {
            rider_id: rider_id.to_string(),
            vehicle,
            status,
        })
    }

    async fn set_on_trip(&self, rider_id: &str, on_trip: bool) -> DispatchResult<()> {
        let vehicle = self.require_rider_vehicle(rider_id).await?;
        let Some(mut availability) = self.store.get_availability(rider_id).await? else {
            return Err(DispatchError::rider_not_found(rider_id));
        };

        availability.status = if on_trip {
            AvailabilityStatus::OnlineOnTrip
        } else {
            AvailabilityStatus::OnlineIdle
        };
        self.publish_availability(&availability, &vehicle).await
    }

    async fn availability(&self, rider_id: &str) -> DispatchResult<Option<RiderAvailability>> {
        self.store.get_availability(rider_id).await
    }
}
