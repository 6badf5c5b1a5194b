// src/services/dispatch_service.rs
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::ride::{
        quote_fare, AssignedRider, CancelRequest, OfferResponseRequest, RequestStatusResponse,
        RideRequest, RideRequestDraft, SubmitOtpRequest, SubmitOtpResponse, SubmitRequestResponse,
    },
    models::trip::{CancelActor, Trip, TripEvent, TripResponse, TripState},
    models::user::UserRole,
    models::vehicle::{AvailabilityStatus, HeartbeatRequest},
    services::{
        matcher::Matcher,
        notify_service::{LifecycleNotification, NotificationGateway, NotificationKind},
        rider_service::{RiderOperations, RiderService},
        store::EntityStore,
    },
    utils::id_generator::{generate_otp, IdType, WithGeneratedId},
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub offer_timeout: Duration,
    pub search_budget: Duration,
    pub search_backoff: Duration,
    pub initial_radius_meters: f64,
    pub max_radius_meters: f64,
    pub max_candidates: usize,
    pub otp_attempt_limit: u8,
    pub proximity_threshold_meters: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        fn env_u64(key: &str, default: u64) -> u64 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn env_f64(key: &str, default: f64) -> f64 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        Self {
            offer_timeout: Duration::from_secs(env_u64("OFFER_TIMEOUT_SECS", 15)),
            search_budget: Duration::from_secs(env_u64("SEARCH_BUDGET_SECS", 120)),
            search_backoff: Duration::from_secs(env_u64("SEARCH_BACKOFF_SECS", 2)),
            initial_radius_meters: env_f64("SEARCH_RADIUS_METERS", 2_000.0),
            max_radius_meters: env_f64("SEARCH_MAX_RADIUS_METERS", 8_000.0),
            max_candidates: env_u64("MAX_CANDIDATES", 10) as usize,
            otp_attempt_limit: env_u64("OTP_ATTEMPT_LIMIT", 3) as u8,
            proximity_threshold_meters: env_f64("PROXIMITY_THRESHOLD_METERS", 75.0),
        }
    }
}

/// A pending offer awaiting the rider's answer. The matching task parks on
/// the receiving half; `respond_to_offer` consumes the sender exactly once.
struct OfferSlot {
    rider_id: String,
    reply_tx: oneshot::Sender<bool>,
}

/// The single entry point for everything that moves a ride request or trip
/// through its lifecycle. All transitions on one request (and its trip) are
/// serialised through a per-request async mutex; distinct requests interleave
/// freely. The offer wait never blocks a handler task, it lives in the
/// spawned matching task.
pub struct DispatchService {
    store: Arc<EntityStore>,
    matcher: Arc<Matcher>,
    rider_service: Arc<RiderService>,
    gateway: Arc<dyn NotificationGateway>,
    config: DispatchConfig,
    offers: AsyncMutex<HashMap<String, OfferSlot>>,
    entity_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    pending_cancels: std::sync::Mutex<HashSet<String>>,
    otp_attempts: std::sync::Mutex<HashMap<String, u8>>,
}

impl DispatchService {
    pub fn new(
        store: Arc<EntityStore>,
        matcher: Arc<Matcher>,
        rider_service: Arc<RiderService>,
        gateway: Arc<dyn NotificationGateway>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            matcher,
            rider_service,
            gateway,
            config,
            offers: AsyncMutex::new(HashMap::new()),
            entity_locks: std::sync::Mutex::new(HashMap::new()),
            pending_cancels: std::sync::Mutex::new(HashSet::new()),
            otp_attempts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One mutex per request id, shared by the request and its trip. Trip
    /// operations lock through `trip.ride_request_id` so there is a single
    /// lock order and no second key to deadlock on.
    fn lock_for(&self, request_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.entity_locks.lock().expect("entity lock table poisoned");
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop a lock table entry nobody holds any more. Called after a request
    /// reaches a terminal state so the table tracks live requests only; a
    /// racing holder keeps its clone alive and the entry stays put.
    fn release_lock(&self, request_id: &str) {
        let mut locks = self.entity_locks.lock().expect("entity lock table poisoned");
        if locks
            .get(request_id)
            .map(|entry| Arc::strong_count(entry) == 1)
            .unwrap_or(false)
        {
            locks.remove(request_id);
        }
    }

    fn cancel_pending(&self, request_id: &str) -> bool {
        self.pending_cancels
            .lock()
            .expect("cancel flag table poisoned")
            .contains(request_id)
    }

    /// Store and geo failures that look transient get up to 3 attempts with a
    /// short growing pause before surfacing `ServiceUnavailable`.
    async fn retried<T, Fut>(&self, mut attempt: impl FnMut() -> Fut) -> DispatchResult<T>
    where
        Fut: Future<Output = DispatchResult<T>>,
    {
        let mut delay = Duration::from_millis(50);
        let mut last_try = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && last_try < 2 => {
                    tracing::warn!("Transient store error (attempt {}): {}", last_try + 1, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    last_try += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(DispatchError::ServiceUnavailable(e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify(&self, notification: LifecycleNotification) {
        // Gateway failures never block a transition.
        if let Err(e) = self.gateway.notify(notification).await {
            tracing::warn!("Notification emission failed: {}", e);
        }
    }

    pub async fn submit_request(
        self: Arc<Self>,
        draft: RideRequestDraft,
    ) -> DispatchResult<SubmitRequestResponse> {
        tracing::info!(
            "Ride request from {}: {:?} x{}",
            draft.traveller_id,
            draft.vehicle_type,
            draft.passenger_count
        );

        if !draft.pickup.point.is_valid() || !draft.drop.point.is_valid() {
            return Err(DispatchError::validation_error(
                "pickup/drop",
                "Coordinates must be finite and in range",
            ));
        }
        if draft.passenger_count == 0 {
            return Err(DispatchError::validation_error(
                "passenger_count",
                "At least one passenger is required",
            ));
        }
        let type_max = draft.vehicle_type.max_capacity();
        if draft.passenger_count > type_max {
            // Never clamped down to fit; the traveller picks a bigger vehicle.
            return Err(DispatchError::CapacityExceeded {
                requested: draft.passenger_count,
                capacity: type_max,
            });
        }

        let traveller = self
            .store
            .get_user(&draft.traveller_id)
            .await?
            .ok_or_else(|| DispatchError::user_not_found(&draft.traveller_id))?;
        if traveller.role != UserRole::Traveller {
            return Err(DispatchError::validation_error(
                "traveller_id",
                "Only users in the TRAVELLER role can request rides",
            ));
        }
        if let Some(active) = self.store.active_request_for_traveller(&traveller.id).await? {
            return Err(DispatchError::validation_error(
                "traveller_id",
                format!("An active ride request already exists: {}", active.id),
            ));
        }

        let fare_quote = quote_fare(draft.vehicle_type, &draft.pickup, &draft.drop);
        let mut request = RideRequest {
            id: String::new(),
            traveller_id: traveller.id,
            rider_id: None,
            pickup: draft.pickup,
            drop: draft.drop,
            requested_vehicle_type: draft.vehicle_type,
            passenger_count: draft.passenger_count,
            status: TripState::Requested,
            fare_quote,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        request.set_generated_id(IdType::Request);
        self.retried(|| {
            let store = self.store.clone();
            let request = request.clone();
            async move { store.put_request(&request).await }
        })
        .await?;

        request.status = request.status.apply(TripEvent::Validated)?;
        request.updated_at = Utc::now();
        self.retried(|| {
            let store = self.store.clone();
            let request = request.clone();
            async move { store.put_request(&request).await }
        })
        .await?;

        self.notify(
            LifecycleNotification::new(&request.traveller_id, NotificationKind::SearchStarted)
                .for_request(&request.id)
                .with_payload(json!({ "fare_quote": fare_quote })),
        )
        .await;

        let service = Arc::clone(&self);
        let request_id = request.id.clone();
        tokio::spawn(async move {
            service.run_matching(request_id).await;
        });

        Ok(SubmitRequestResponse {
            request_id: request.id,
            status: request.status,
            fare_quote,
        })
    }

    /// Sequential offer loop. One pending offer per request at any instant,
    /// and a rider holding an offer is skipped for other requests. Exhausted
    /// candidate sets back off and widen the radius until the search budget
    /// runs out, at which point the request expires.
    async fn run_matching(self: Arc<Self>, request_id: String) {
        let deadline = tokio::time::Instant::now() + self.config.search_budget;
        let mut radius = self.config.initial_radius_meters;
        let mut backoff = self.config.search_backoff;

        loop {
            let Some(request) = self.current_request_if_searching(&request_id).await else {
                return;
            };

            let candidates = match self.matcher.find_candidates(&request, radius, Utc::now()) {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!("Candidate query failed for {}: {}", request_id, e);
                    Vec::new()
                }
            };

            for candidate in candidates {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                match self.rider_dispatchable(&candidate.rider_id).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(
                            "Eligibility check failed for {} on {}: {}",
                            candidate.rider_id,
                            request_id,
                            e
                        );
                        continue;
                    }
                }

                let (reply_tx, reply_rx) = oneshot::channel();
                {
                    // Scan and insert under one lock so two requests cannot
                    // both claim the rider between the check and the insert.
                    let mut offers = self.offers.lock().await;
                    if offers.values().any(|slot| slot.rider_id == candidate.rider_id) {
                        continue;
                    }
                    offers.insert(
                        request_id.clone(),
                        OfferSlot {
                            rider_id: candidate.rider_id.clone(),
                            reply_tx,
                        },
                    );
                }
                tracing::info!(
                    "Offering request {} to rider {} ({:.0}m away)",
                    request_id,
                    candidate.rider_id,
                    candidate.distance_meters
                );
                self.notify(
                    LifecycleNotification::new(&candidate.rider_id, NotificationKind::OfferIssued)
                        .for_request(&request_id)
                        .with_payload(json!({
                            "pickup": request.pickup,
                            "drop": request.drop,
                            "passenger_count": request.passenger_count,
                            "fare_quote": request.fare_quote,
                            "distance_meters": candidate.distance_meters,
                        })),
                )
                .await;

                let accepted = tokio::select! {
                    reply = reply_rx => reply.unwrap_or(false),
                    _ = tokio::time::sleep(self.config.offer_timeout) => {
                        tracing::debug!(
                            "Offer to {} for {} timed out",
                            candidate.rider_id,
                            request_id
                        );
                        false
                    }
                };

                // Reclaim the slot on timeout; respond_to_offer removes it on
                // an explicit answer.
                {
                    let mut offers = self.offers.lock().await;
                    if offers
                        .get(&request_id)
                        .map(|slot| slot.rider_id == candidate.rider_id)
                        .unwrap_or(false)
                    {
                        offers.remove(&request_id);
                    }
                }

                if accepted {
                    return;
                }
                if self.current_request_if_searching(&request_id).await.is_none() {
                    return;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.expire_request(&request_id).await;
                return;
            }

            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
            radius = (radius * 1.5).min(self.config.max_radius_meters);
        }
    }

    async fn current_request_if_searching(&self, request_id: &str) -> Option<RideRequest> {
        match self.store.get_request(request_id).await {
            Ok(Some(request)) if request.status == TripState::Searching => Some(request),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Request fetch failed during matching for {}: {}", request_id, e);
                None
            }
        }
    }

    /// A rider may hold at most one active trip, so both offer issuance and
    /// offer acceptance re-verify the rider is idle and trip-free; the
    /// candidate list can be stale by the time either happens.
    async fn rider_dispatchable(&self, rider_id: &str) -> DispatchResult<bool> {
        if self.store.active_trip_for_rider(rider_id).await?.is_some() {
            return Ok(false);
        }
        let availability = self.rider_service.availability(rider_id).await?;
        Ok(matches!(availability, Some(a) if a.status == AvailabilityStatus::OnlineIdle))
    }

    async fn expire_request(&self, request_id: &str) {
        self.expire_locked(request_id).await;
        self.release_lock(request_id);
    }

    async fn expire_locked(&self, request_id: &str) {
        let lock = self.lock_for(request_id);
        let _guard = lock.lock().await;

        let Ok(Some(mut request)) = self.store.get_request(request_id).await else {
            return;
        };
        if request.status != TripState::Searching || self.cancel_pending(request_id) {
            return;
        }
        let Ok(next) = request.status.apply(TripEvent::SearchExhausted) else {
            return;
        };
        request.status = next;
        request.updated_at = Utc::now();
        if let Err(e) = self.store.put_request(&request).await {
            tracing::error!("Failed to persist expiry of {}: {}", request_id, e);
            return;
        }
        tracing::info!("Request {} expired: search budget exhausted", request_id);
        self.notify(
            LifecycleNotification::new(&request.traveller_id, NotificationKind::SearchExpired)
                .for_request(request_id),
        )
        .await;
    }

    /// Only the currently offered rider may answer. A missing slot means the
    /// offer already timed out or the request moved on (`StaleOffer`); a slot
    /// held by a different rider means this rider was never offered the
    /// request (`NotOffered`).
    pub async fn respond_to_offer(
        &self,
        rider_id: &str,
        response: OfferResponseRequest,
    ) -> DispatchResult<Option<TripResponse>> {
        let slot = {
            let mut offers = self.offers.lock().await;
            let holder = match offers.get(&response.request_id) {
                None => return Err(DispatchError::StaleOffer(response.request_id.clone())),
                Some(slot) => slot.rider_id.clone(),
            };
            if holder != rider_id {
                return Err(DispatchError::NotOffered(rider_id.to_string()));
            }
            offers
                .remove(&response.request_id)
                .ok_or_else(|| DispatchError::StaleOffer(response.request_id.clone()))?
        };

        if !response.accept {
            tracing::info!("Rider {} declined request {}", rider_id, response.request_id);
            let _ = slot.reply_tx.send(false);
            return Ok(None);
        }

        let lock = self.lock_for(&response.request_id);
        let _guard = lock.lock().await;

        if self.cancel_pending(&response.request_id) {
            // The in-flight cancel owns the outcome; report the state it
            // will leave behind.
            let _ = slot.reply_tx.send(false);
            return Err(DispatchError::invalid_transition(
                TripState::Cancelled.as_str(),
                TripEvent::OfferAccepted.name(),
            ));
        }

        let mut request = self
            .store
            .get_request(&response.request_id)
            .await?
            .ok_or_else(|| DispatchError::RequestNotFound(response.request_id.clone()))?;
        if request.status != TripState::Searching {
            let _ = slot.reply_tx.send(false);
            return Err(DispatchError::StaleOffer(response.request_id.clone()));
        }
        // The rider may have been assigned elsewhere since the offer went
        // out; a second concurrent trip must never be created.
        if !self.rider_dispatchable(rider_id).await? {
            let _ = slot.reply_tx.send(false);
            return Err(DispatchError::RiderNotAvailable(rider_id.to_string()));
        }

        request.status = request.status.apply(TripEvent::OfferAccepted)?;
        request.rider_id = Some(rider_id.to_string());
        request.updated_at = Utc::now();

        let mut trip = Trip {
            id: String::new(),
            ride_request_id: request.id.clone(),
            rider_id: rider_id.to_string(),
            traveller_id: request.traveller_id.clone(),
            otp: generate_otp(),
            state: TripState::Assigned,
            pickup_reached_at: None,
            started_at: None,
            completed_at: None,
            cancelled_by: None,
            cancel_reason: None,
            fare_final: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        trip.set_generated_id(IdType::Trip);

        self.retried(|| {
            let store = self.store.clone();
            let trip = trip.clone();
            async move { store.put_trip(&trip).await }
        })
        .await?;
        self.retried(|| {
            let store = self.store.clone();
            let request = request.clone();
            async move { store.put_request(&request).await }
        })
        .await?;
        self.rider_service.set_on_trip(rider_id, true).await?;

        let _ = slot.reply_tx.send(true);
        tracing::info!(
            "Request {} assigned to rider {} as trip {}",
            request.id,
            rider_id,
            trip.id
        );

        self.notify(
            LifecycleNotification::new(&request.traveller_id, NotificationKind::RideAssigned)
                .for_request(&request.id)
                .for_trip(&trip.id)
                .with_payload(json!({ "otp": trip.otp, "rider_id": rider_id })),
        )
        .await;
        self.notify(
            LifecycleNotification::new(rider_id, NotificationKind::RideAssigned)
                .for_request(&request.id)
                .for_trip(&trip.id)
                .with_payload(json!({ "pickup": request.pickup, "drop": request.drop })),
        )
        .await;

        Ok(Some(TripResponse::from(trip)))
    }

    /// Heartbeats double as the arrival signal: while the rider's active trip
    /// is pre-pickup, position updates drive the RiderArriving/RiderArrived
    /// transitions. Repeated heartbeats at the same spot are idempotent.
    pub async fn heartbeat(
        &self,
        rider_id: &str,
        heartbeat: HeartbeatRequest,
    ) -> DispatchResult<()> {
        let position = heartbeat.position;
        self.rider_service.apply_heartbeat(rider_id, heartbeat).await?;

        let Some(trip) = self.store.active_trip_for_rider(rider_id).await? else {
            return Ok(());
        };
        if !matches!(trip.state, TripState::Assigned | TripState::RiderArriving) {
            return Ok(());
        }

        let lock = self.lock_for(&trip.ride_request_id);
        let _guard = lock.lock().await;
        if self.cancel_pending(&trip.ride_request_id) {
            return Ok(());
        }

        // Re-fetch under the lock; the trip may have moved since the check.
        let Some(mut trip) = self.store.get_trip(&trip.id).await? else {
            return Ok(());
        };
        let Some(request) = self.store.get_request(&trip.ride_request_id).await? else {
            return Ok(());
        };

        let distance = position.distance_meters(&request.pickup.point);
        let event = if distance <= self.config.proximity_threshold_meters {
            match trip.state {
                TripState::Assigned | TripState::RiderArriving => Some(TripEvent::ReachedPickup),
                _ => None,
            }
        } else if trip.state == TripState::Assigned {
            Some(TripEvent::RiderEnRoute)
        } else {
            None
        };
        let Some(event) = event else {
            return Ok(());
        };

        trip.state = trip.state.apply(event)?;
        if trip.state == TripState::RiderArrived {
            trip.pickup_reached_at = Some(Utc::now());
        }
        trip.updated_at = Utc::now();
        self.retried(|| {
            let store = self.store.clone();
            let trip = trip.clone();
            async move { store.put_trip(&trip).await }
        })
        .await?;

        let kind = match trip.state {
            TripState::RiderArrived => NotificationKind::RiderArrived,
            _ => NotificationKind::RiderArriving,
        };
        tracing::info!(
            "Trip {}: rider {} now {} ({:.0}m from pickup)",
            trip.id,
            rider_id,
            trip.state.as_str(),
            distance
        );
        for recipient in [&trip.traveller_id, &trip.rider_id] {
            self.notify(
                LifecycleNotification::new(recipient, kind)
                    .for_trip(&trip.id)
                    .with_payload(json!({ "distance_meters": distance })),
            )
            .await;
        }
        Ok(())
    }

    /// OTP check at the pickup. A wrong code never moves the state; the third
    /// consecutive miss raises a SYSTEM re-verification notification and
    /// resets the counter. The code itself never changes before trip start.
    pub async fn submit_otp(
        &self,
        trip_id: &str,
        submission: SubmitOtpRequest,
    ) -> DispatchResult<SubmitOtpResponse> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| DispatchError::trip_not_found(trip_id))?;

        let lock = self.lock_for(&trip.ride_request_id);
        let _guard = lock.lock().await;
        if self.cancel_pending(&trip.ride_request_id) {
            return Err(DispatchError::invalid_transition(
                TripState::Cancelled.as_str(),
                TripEvent::OtpMatched.name(),
            ));
        }

        let Some(mut trip) = self.store.get_trip(trip_id).await? else {
            return Err(DispatchError::trip_not_found(trip_id));
        };
        // Ordering guard first, then equality: a correct code in the wrong
        // state is still rejected.
        let next = trip.state.apply(TripEvent::OtpMatched)?;

        if submission.code != trip.otp {
            let escalate = {
                let mut attempts = self.otp_attempts.lock().expect("otp table poisoned");
                let count = attempts.entry(trip.id.clone()).or_insert(0);
                *count += 1;
                if *count >= self.config.otp_attempt_limit {
                    *count = 0;
                    true
                } else {
                    false
                }
            };
            if escalate {
                tracing::warn!("Trip {}: OTP attempt limit reached, re-verification required", trip.id);
                self.notify(
                    LifecycleNotification::new(&trip.traveller_id, NotificationKind::OtpReverification)
                        .for_trip(&trip.id)
                        .with_payload(json!({ "actor": CancelActor::System.as_str() })),
                )
                .await;
            }
            return Ok(SubmitOtpResponse {
                verified: false,
                state: trip.state,
            });
        }

        trip.state = next;
        trip.updated_at = Utc::now();
        self.retried(|| {
            let store = self.store.clone();
            let trip = trip.clone();
            async move { store.put_trip(&trip).await }
        })
        .await?;
        self.otp_attempts
            .lock()
            .expect("otp table poisoned")
            .remove(&trip.id);

        tracing::info!("Trip {}: OTP verified", trip.id);
        for recipient in [&trip.traveller_id, &trip.rider_id] {
            self.notify(
                LifecycleNotification::new(recipient, NotificationKind::OtpVerified)
                    .for_trip(&trip.id),
            )
            .await;
        }
        Ok(SubmitOtpResponse {
            verified: true,
            state: trip.state,
        })
    }

    pub async fn start_trip(&self, trip_id: &str) -> DispatchResult<TripResponse> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| DispatchError::trip_not_found(trip_id))?;
        let lock = self.lock_for(&trip.ride_request_id);
        let _guard = lock.lock().await;
        if self.cancel_pending(&trip.ride_request_id) {
            return Err(DispatchError::invalid_transition(
                TripState::Cancelled.as_str(),
                TripEvent::StartConfirmed.name(),
            ));
        }

        let Some(mut trip) = self.store.get_trip(trip_id).await? else {
            return Err(DispatchError::trip_not_found(trip_id));
        };
        trip.state = trip.state.apply(TripEvent::StartConfirmed)?;
        trip.started_at = Some(Utc::now());
        trip.updated_at = Utc::now();
        self.retried(|| {
            let store = self.store.clone();
            let trip = trip.clone();
            async move { store.put_trip(&trip).await }
        })
        .await?;

        tracing::info!("Trip {} started", trip.id);
        for recipient in [&trip.traveller_id, &trip.rider_id] {
            self.notify(
                LifecycleNotification::new(recipient, NotificationKind::TripStarted)
                    .for_trip(&trip.id),
            )
            .await;
        }
        Ok(TripResponse::from(trip))
    }

    pub async fn complete_trip(&self, trip_id: &str) -> DispatchResult<TripResponse> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| DispatchError::trip_not_found(trip_id))?;
        let lock = self.lock_for(&trip.ride_request_id);
        let guard = lock.lock().await;
        if self.cancel_pending(&trip.ride_request_id) {
            return Err(DispatchError::invalid_transition(
                TripState::Cancelled.as_str(),
                TripEvent::EndConfirmed.name(),
            ));
        }

        let Some(mut trip) = self.store.get_trip(trip_id).await? else {
            return Err(DispatchError::trip_not_found(trip_id));
        };
        let mut request = self
            .store
            .get_request(&trip.ride_request_id)
            .await?
            .ok_or_else(|| DispatchError::RequestNotFound(trip.ride_request_id.clone()))?;

        trip.state = trip.state.apply(TripEvent::EndConfirmed)?;
        trip.completed_at = Some(Utc::now());
        trip.fare_final = Some(request.fare_quote);
        trip.updated_at = Utc::now();
        request.status = trip.state;
        request.updated_at = Utc::now();

        self.retried(|| {
            let store = self.store.clone();
            let trip = trip.clone();
            async move { store.put_trip(&trip).await }
        })
        .await?;
        self.retried(|| {
            let store = self.store.clone();
            let request = request.clone();
            async move { store.put_request(&request).await }
        })
        .await?;
        self.rider_service.set_on_trip(&trip.rider_id, false).await?;

        tracing::info!("Trip {} completed, fare {:.2}", trip.id, request.fare_quote);
        for recipient in [&trip.traveller_id, &trip.rider_id] {
            self.notify(
                LifecycleNotification::new(recipient, NotificationKind::TripCompleted)
                    .for_trip(&trip.id)
                    .with_payload(json!({ "fare": request.fare_quote })),
            )
            .await;
        }

        drop(guard);
        drop(lock);
        self.release_lock(&trip.ride_request_id);
        Ok(TripResponse::from(trip))
    }

    /// Cancellation is valid from every non-terminal state. The pending flag
    /// is raised before taking the entity lock, so a cancel racing a normal
    /// transition wins whichever order the lock is granted in; the loser gets
    /// `InvalidTransition`, never a silent override.
    pub async fn cancel(&self, id: &str, cancel: CancelRequest) -> DispatchResult<RequestStatusResponse> {
        // Clients hold either id once a trip exists, so both are accepted;
        // a trip id resolves to the request it serves.
        let request_id = match self.store.get_request(id).await? {
            Some(request) => request.id,
            None => self
                .store
                .get_trip(id)
                .await?
                .map(|trip| trip.ride_request_id)
                .ok_or_else(|| DispatchError::RequestNotFound(id.to_string()))?,
        };

        self.pending_cancels
            .lock()
            .expect("cancel flag table poisoned")
            .insert(request_id.clone());

        let result = self.cancel_locked(&request_id, cancel).await;

        self.pending_cancels
            .lock()
            .expect("cancel flag table poisoned")
            .remove(&request_id);
        self.release_lock(&request_id);
        result
    }

    async fn cancel_locked(&self, request_id: &str, cancel: CancelRequest) -> DispatchResult<RequestStatusResponse> {
        let lock = self.lock_for(request_id);
        let _guard = lock.lock().await;

        let mut request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| DispatchError::RequestNotFound(request_id.to_string()))?;
        let trip = self.store.trip_by_request(request_id).await?;

        let current = trip.as_ref().map(|t| t.state).unwrap_or(request.status);
        if current.is_terminal() {
            // Terminal entities report their state so clients can reconcile.
            return Err(DispatchError::invalid_transition(
                current.as_str(),
                TripEvent::Cancel(cancel.actor).name(),
            ));
        }
        let cancelled = current.apply(TripEvent::Cancel(cancel.actor))?;
        let after_dispatch = trip.is_some();

        if let Some(mut trip) = trip {
            trip.state = cancelled;
            trip.cancelled_by = Some(cancel.actor);
            trip.cancel_reason = cancel.reason.clone();
            trip.updated_at = Utc::now();
            self.retried(|| {
                let store = self.store.clone();
                let trip = trip.clone();
                async move { store.put_trip(&trip).await }
            })
            .await?;
            self.otp_attempts
                .lock()
                .expect("otp table poisoned")
                .remove(&trip.id);
            self.rider_service.set_on_trip(&trip.rider_id, false).await?;

            for recipient in [&trip.traveller_id, &trip.rider_id] {
                self.notify(
                    LifecycleNotification::new(recipient, NotificationKind::TripCancelled)
                        .for_request(request_id)
                        .for_trip(&trip.id)
                        .with_payload(json!({
                            "actor": cancel.actor.as_str(),
                            "reason": cancel.reason,
                        })),
                )
                .await;
            }
        } else {
            self.notify(
                LifecycleNotification::new(&request.traveller_id, NotificationKind::TripCancelled)
                    .for_request(request_id)
                    .with_payload(json!({
                        "actor": cancel.actor.as_str(),
                        "reason": cancel.reason,
                    })),
            )
            .await;
        }

        request.status = cancelled;
        request.updated_at = Utc::now();
        self.retried(|| {
            let store = self.store.clone();
            let request = request.clone();
            async move { store.put_request(&request).await }
        })
        .await?;

        if after_dispatch && cancel.actor == CancelActor::Traveller {
            self.notify(
                LifecycleNotification::new(&request.traveller_id, NotificationKind::CancellationPenalty)
                    .for_request(request_id),
            )
            .await;
        }

        tracing::info!(
            "Request {} cancelled by {} ({:?})",
            request_id,
            cancel.actor.as_str(),
            cancel.reason
        );
        self.status_response(request).await
    }

    pub async fn get_request_status(&self, request_id: &str) -> DispatchResult<RequestStatusResponse> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| DispatchError::RequestNotFound(request_id.to_string()))?;
        self.status_response(request).await
    }

    async fn status_response(&self, request: RideRequest) -> DispatchResult<RequestStatusResponse> {
        let trip = self.store.trip_by_request(&request.id).await?;
        let status = trip.as_ref().map(|t| t.state).unwrap_or(request.status);

        let assigned_rider = match &request.rider_id {
            Some(rider_id) => {
                let user = self.store.get_user(rider_id).await?;
                let vehicle = self.store.vehicle_by_owner(rider_id).await?;
                match (user, vehicle) {
                    (Some(user), Some(vehicle)) => Some(AssignedRider {
                        rider_id: rider_id.clone(),
                        name: user.name,
                        vehicle_type: vehicle.vehicle_type,
                        registration_number: vehicle.registration_number,
                        rating_average: user.rating_average,
                    }),
                    _ => None,
                }
            }
            None => None,
        };

        Ok(RequestStatusResponse {
            request_id: request.id,
            status,
            trip_id: trip.map(|t| t.id),
            assigned_rider,
            fare_quote: request.fare_quote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geo::{GeoPoint, Place};
    use crate::models::user::User;
    use crate::models::vehicle::{AvailabilityStatus, RiderRegistration, VehicleType};
    use crate::services::geo_index::GeoIndex;
    use crate::services::notify_service::RecordingGateway;

    struct Harness {
        store: Arc<EntityStore>,
        dispatch: Arc<DispatchService>,
        rider_service: Arc<RiderService>,
        gateway: Arc<RecordingGateway>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(EntityStore::memory());
        let geo = Arc::new(GeoIndex::new(30));
        let matcher = Arc::new(Matcher::new(geo.clone(), 10));
        let rider_service = Arc::new(RiderService::new(store.clone(), geo.clone()));
        let gateway = Arc::new(RecordingGateway::new());
        let dispatch = Arc::new(DispatchService::new(
            store.clone(),
            matcher,
            rider_service.clone(),
            gateway.clone(),
            DispatchConfig::default(),
        ));
        Harness {
            store,
            dispatch,
            rider_service,
            gateway,
        }
    }

    async fn seed_user(store: &EntityStore, id: &str, phone: &str, role: UserRole) {
        store
            .put_user(&User {
                id: id.to_string(),
                name: format!("user {}", id),
                phone: phone.to_string(),
                role,
                rating_average: 0.0,
                rating_count: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn seed_online_rider(h: &Harness, id: &str, phone: &str, lat: f64, lng: f64) {
        seed_user(&h.store, id, phone, UserRole::Rider).await;
        h.rider_service
            .register_rider(RiderRegistration {
                user_id: id.to_string(),
                vehicle_type: VehicleType::Auto,
                capacity: Some(4),
                registration_number: format!("AS-11-{}", id),
            })
            .await
            .unwrap();
        h.rider_service
            .apply_heartbeat(
                id,
                HeartbeatRequest {
                    position: GeoPoint::new(lat, lng),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
    }

    fn draft(traveller_id: &str, passengers: u8) -> RideRequestDraft {
        RideRequestDraft {
            traveller_id: traveller_id.to_string(),
            pickup: Place {
                address: "Hailakandi Rd".to_string(),
                point: GeoPoint::new(24.3735, 92.1624),
            },
            drop: Place {
                address: "Silchar".to_string(),
                point: GeoPoint::new(24.8170, 92.7789),
            },
            vehicle_type: VehicleType::Auto,
            passenger_count: passengers,
        }
    }

    async fn settle() {
        // Lets the spawned matching task reach its offer wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_above_type_max_is_rejected_outright() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv01", "+919862000001", UserRole::Traveller).await;

        let err = h.dispatch.clone().submit_request(draft("usr-250830-trv01", 7)).await.unwrap_err();
        match err {
            DispatchError::CapacityExceeded { requested, capacity } => {
                assert_eq!(requested, 7);
                assert_eq!(capacity, 6);
            }
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_offers_nearest_first() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv02", "+919862000002", UserRole::Traveller).await;
        seed_online_rider(&h, "usr-250830-ridr1", "+919862000003", 24.378, 92.165).await;
        seed_online_rider(&h, "usr-250830-ridr2", "+919862000004", 24.388, 92.168).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv02", 2)).await.unwrap();
        assert_eq!(submitted.status, TripState::Searching);
        settle().await;

        // The nearer rider gets the first and only pending offer.
        let offers = h.gateway.sent_to("usr-250830-ridr1");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].kind, NotificationKind::OfferIssued);
        assert!(h.gateway.sent_to("usr-250830-ridr2").is_empty());

        // Decline moves the offer to the next candidate.
        let declined = h
            .dispatch
            .respond_to_offer(
                "usr-250830-ridr1",
                OfferResponseRequest {
                    request_id: submitted.request_id.clone(),
                    accept: false,
                },
            )
            .await
            .unwrap();
        assert!(declined.is_none());
        settle().await;
        assert_eq!(h.gateway.sent_to("usr-250830-ridr2").len(), 1);

        let trip = h
            .dispatch
            .respond_to_offer(
                "usr-250830-ridr2",
                OfferResponseRequest {
                    request_id: submitted.request_id.clone(),
                    accept: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trip.state, TripState::Assigned);
        assert_eq!(trip.rider_id, "usr-250830-ridr2");

        let status = h.dispatch.get_request_status(&submitted.request_id).await.unwrap();
        assert_eq!(status.status, TripState::Assigned);
        assert_eq!(status.trip_id.as_deref(), Some(trip.id.as_str()));
        assert_eq!(
            status.assigned_rider.unwrap().rider_id,
            "usr-250830-ridr2"
        );

        // The first rider's change of heart arrives after the window closed.
        let err = h
            .dispatch
            .respond_to_offer(
                "usr-250830-ridr1",
                OfferResponseRequest {
                    request_id: submitted.request_id,
                    accept: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StaleOffer(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_timeout_advances_to_next_rider() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv03", "+919862000005", UserRole::Traveller).await;
        seed_online_rider(&h, "usr-250830-ridr3", "+919862000006", 24.378, 92.165).await;
        seed_online_rider(&h, "usr-250830-rid10", "+919862000007", 24.388, 92.168).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv03", 2)).await.unwrap();
        settle().await;
        assert_eq!(h.gateway.sent_to("usr-250830-ridr3").len(), 1);

        // Sit through the 15s acceptance window without answering.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(h.gateway.sent_to("usr-250830-rid10").len(), 1);

        let err = h
            .dispatch
            .respond_to_offer(
                "usr-250830-ridr3",
                OfferResponseRequest {
                    request_id: submitted.request_id,
                    accept: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StaleOffer(_) | DispatchError::NotOffered(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_budget_exhaustion_expires_request() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv04", "+919862000008", UserRole::Traveller).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv04", 2)).await.unwrap();
        settle().await;

        let status = h.dispatch.get_request_status(&submitted.request_id).await.unwrap();
        assert_eq!(status.status, TripState::Searching);

        tokio::time::sleep(Duration::from_secs(150)).await;

        let status = h.dispatch.get_request_status(&submitted.request_id).await.unwrap();
        assert_eq!(status.status, TripState::Expired);
        let expirations = h.gateway.sent_to("usr-250830-trv04");
        assert!(expirations
            .iter()
            .any(|n| n.kind == NotificationKind::SearchExpired));
        assert!(h.dispatch.entity_locks.lock().unwrap().is_empty());
    }

    async fn assigned_trip(h: &Harness) -> (String, TripResponse) {
        seed_user(&h.store, "usr-250830-trv05", "+919862000009", UserRole::Traveller).await;
        seed_online_rider(h, "usr-250830-ridr5", "+919862000010", 24.378, 92.165).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv05", 2)).await.unwrap();
        settle().await;
        let trip = h
            .dispatch
            .respond_to_offer(
                "usr-250830-ridr5",
                OfferResponseRequest {
                    request_id: submitted.request_id.clone(),
                    accept: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        (submitted.request_id, trip)
    }

    #[tokio::test(start_paused = true)]
    async fn test_proximity_heartbeats_drive_arrival() {
        let h = harness().await;
        let (_, trip) = assigned_trip(&h).await;

        // Far away first: en-route, not arrived.
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.3800, 92.1700),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TripState::RiderArriving);

        // Within 75m of the pickup point.
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TripState::RiderArrived);
        assert!(stored.pickup_reached_at.is_some());

        // Repeats at the pickup are idempotent.
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TripState::RiderArrived);
    }

    #[tokio::test(start_paused = true)]
    async fn test_otp_wrong_code_escalates_without_transition() {
        let h = harness().await;
        let (_, trip) = assigned_trip(&h).await;
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();

        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        let wrong = if stored.otp == "0000" { "9999" } else { "0000" };

        for _ in 0..3 {
            let res = h
                .dispatch
                .submit_otp(&trip.id, SubmitOtpRequest { code: wrong.to_string() })
                .await
                .unwrap();
            assert!(!res.verified);
            assert_eq!(res.state, TripState::RiderArrived);
        }
        let escalations: Vec<_> = h
            .gateway
            .sent_to("usr-250830-trv05")
            .into_iter()
            .filter(|n| n.kind == NotificationKind::OtpReverification)
            .collect();
        assert_eq!(escalations.len(), 1);

        // OTP is unchanged after the escalation; the right code still works.
        let res = h
            .dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp.clone() })
            .await
            .unwrap();
        assert!(res.verified);
        assert_eq!(res.state, TripState::OtpVerified);

        // Verification happens exactly once.
        let err = h
            .dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_otp_rejected_before_arrival() {
        let h = harness().await;
        let (_, trip) = assigned_trip(&h).await;
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        let err = h
            .dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap_err();
        match err {
            DispatchError::InvalidTransition { current, .. } => assert_eq!(current, "ASSIGNED"),
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_finalises_quoted_fare_and_frees_rider() {
        let h = harness().await;
        let (request_id, trip) = assigned_trip(&h).await;
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        h.dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap();
        h.dispatch.start_trip(&trip.id).await.unwrap();
        let completed = h.dispatch.complete_trip(&trip.id).await.unwrap();

        let status = h.dispatch.get_request_status(&request_id).await.unwrap();
        assert_eq!(completed.state, TripState::Completed);
        assert_eq!(completed.fare_final, Some(status.fare_quote));

        let availability = h
            .rider_service
            .availability("usr-250830-ridr5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(availability.status, AvailabilityStatus::OnlineIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_on_terminal_reports_current_state() {
        let h = harness().await;
        let (request_id, trip) = assigned_trip(&h).await;
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        h.dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap();
        h.dispatch.start_trip(&trip.id).await.unwrap();
        h.dispatch.complete_trip(&trip.id).await.unwrap();

        let err = h
            .dispatch
            .cancel(
                &request_id,
                CancelRequest {
                    actor: CancelActor::Traveller,
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        match err {
            DispatchError::InvalidTransition { current, .. } => assert_eq!(current, "COMPLETED"),
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_cancel_beats_queued_completion() {
        let h = harness().await;
        let (request_id, trip) = assigned_trip(&h).await;
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        h.dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap();
        h.dispatch.start_trip(&trip.id).await.unwrap();

        let cancel_task = {
            let dispatch = h.dispatch.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                dispatch
                    .cancel(
                        &request_id,
                        CancelRequest {
                            actor: CancelActor::Traveller,
                            reason: Some("change of plans".to_string()),
                        },
                    )
                    .await
            })
        };
        let complete_task = {
            let dispatch = h.dispatch.clone();
            let trip_id = trip.id.clone();
            tokio::spawn(async move { dispatch.complete_trip(&trip_id).await })
        };

        let cancel_result = cancel_task.await.unwrap();
        let complete_result = complete_task.await.unwrap();

        // Exactly one of the two wins; the loser sees InvalidTransition with
        // the winner's terminal state, never a silent override.
        let final_state = h.store.get_trip(&trip.id).await.unwrap().unwrap().state;
        match (&cancel_result, &complete_result) {
            (Ok(status), Err(DispatchError::InvalidTransition { current, .. })) => {
                assert_eq!(status.status, TripState::Cancelled);
                assert_eq!(current, "CANCELLED");
                assert_eq!(final_state, TripState::Cancelled);
            }
            (Err(DispatchError::InvalidTransition { current, .. }), Ok(_)) => {
                assert_eq!(current, "COMPLETED");
                assert_eq!(final_state, TripState::Completed);
            }
            other => panic!("expected exactly one winner, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_traveller_cancel_after_dispatch_emits_penalty() {
        let h = harness().await;
        let (request_id, _) = assigned_trip(&h).await;

        h.dispatch
            .cancel(
                &request_id,
                CancelRequest {
                    actor: CancelActor::Traveller,
                    reason: Some("waited too long".to_string()),
                },
            )
            .await
            .unwrap();

        let to_traveller = h.gateway.sent_to("usr-250830-trv05");
        assert!(to_traveller
            .iter()
            .any(|n| n.kind == NotificationKind::CancellationPenalty));
        assert!(to_traveller
            .iter()
            .any(|n| n.kind == NotificationKind::TripCancelled));

        // The rider is released back to the idle pool.
        let availability = h
            .rider_service
            .availability("usr-250830-ridr5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(availability.status, AvailabilityStatus::OnlineIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_search_stops_matching() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv06", "+919862000011", UserRole::Traveller).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv06", 2)).await.unwrap();
        settle().await;

        let status = h
            .dispatch
            .cancel(
                &submitted.request_id,
                CancelRequest {
                    actor: CancelActor::Traveller,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status.status, TripState::Cancelled);

        // No penalty before dispatch, and no later expiry overwrite.
        tokio::time::sleep(Duration::from_secs(150)).await;
        let status = h.dispatch.get_request_status(&submitted.request_id).await.unwrap();
        assert_eq!(status.status, TripState::Cancelled);
        assert!(!h
            .gateway
            .sent_to("usr-250830-trv06")
            .iter()
            .any(|n| n.kind == NotificationKind::CancellationPenalty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_active_request_rejected() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv07", "+919862000012", UserRole::Traveller).await;

        h.dispatch.clone().submit_request(draft("usr-250830-trv07", 2)).await.unwrap();
        let err = h.dispatch.clone().submit_request(draft("usr-250830-trv07", 1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ValidationFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_rejected_when_rider_engaged_elsewhere() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv08", "+919862000013", UserRole::Traveller).await;
        seed_online_rider(&h, "usr-250830-rid13", "+919862000014", 24.378, 92.165).await;

        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv08", 2)).await.unwrap();
        settle().await;
        assert_eq!(h.gateway.sent_to("usr-250830-rid13").len(), 1);

        // The rider gets tied up between receiving the offer and answering.
        h.rider_service.set_on_trip("usr-250830-rid13", true).await.unwrap();

        let err = h
            .dispatch
            .respond_to_offer(
                "usr-250830-rid13",
                OfferResponseRequest {
                    request_id: submitted.request_id.clone(),
                    accept: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RiderNotAvailable(_)));
        assert!(h.store.trip_by_request(&submitted.request_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_candidate_never_yields_second_trip() {
        let h = harness().await;
        seed_user(&h.store, "usr-250830-trv09", "+919862000015", UserRole::Traveller).await;
        seed_user(&h.store, "usr-250830-trv10", "+919862000016", UserRole::Traveller).await;
        // rid14 is nearest to the first pickup, rid15 to the second; both are
        // inside the initial search radius of both, so each request's
        // candidate list holds both riders.
        seed_online_rider(&h, "usr-250830-rid14", "+919862000017", 24.3780, 92.1650).await;
        seed_online_rider(&h, "usr-250830-rid15", "+919862000018", 24.3885, 92.1685).await;

        let first = h.dispatch.clone().submit_request(draft("usr-250830-trv09", 2)).await.unwrap();
        settle().await;
        assert_eq!(h.gateway.sent_to("usr-250830-rid14").len(), 1);

        let mut second_draft = draft("usr-250830-trv10", 2);
        second_draft.pickup.point = GeoPoint::new(24.3880, 92.1680);
        let second = h.dispatch.clone().submit_request(second_draft).await.unwrap();
        settle().await;
        assert_eq!(h.gateway.sent_to("usr-250830-rid15").len(), 1);

        // rid14 takes the first request while still sitting in the second
        // request's snapshot; a decline there must not reach rid14 anymore.
        h.dispatch
            .respond_to_offer(
                "usr-250830-rid14",
                OfferResponseRequest {
                    request_id: first.request_id.clone(),
                    accept: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        h.dispatch
            .respond_to_offer(
                "usr-250830-rid15",
                OfferResponseRequest {
                    request_id: second.request_id.clone(),
                    accept: false,
                },
            )
            .await
            .unwrap();
        settle().await;

        let offers_to_busy: Vec<_> = h
            .gateway
            .sent_to("usr-250830-rid14")
            .into_iter()
            .filter(|n| n.kind == NotificationKind::OfferIssued)
            .collect();
        assert_eq!(offers_to_busy.len(), 1);

        let active = h.store.active_trip_for_rider("usr-250830-rid14").await.unwrap().unwrap();
        assert_eq!(active.ride_request_id, first.request_id);
        assert!(h.store.trip_by_request(&second.request_id).await.unwrap().is_none());

        let status = h.dispatch.get_request_status(&second.request_id).await.unwrap();
        assert_eq!(status.status, TripState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_accepts_trip_id() {
        let h = harness().await;
        let (request_id, trip) = assigned_trip(&h).await;

        let status = h
            .dispatch
            .cancel(
                &trip.id,
                CancelRequest {
                    actor: CancelActor::Rider,
                    reason: Some("breakdown".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(status.request_id, request_id);
        assert_eq!(status.status, TripState::Cancelled);

        let availability = h
            .rider_service
            .availability("usr-250830-ridr5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(availability.status, AvailabilityStatus::OnlineIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_notifications_reach_both_parties() {
        let h = harness().await;
        let (_, trip) = assigned_trip(&h).await;

        // Far first, then at the pickup, then the rest of the trip.
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.3800, 92.1700),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        h.dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap();
        h.dispatch.start_trip(&trip.id).await.unwrap();
        h.dispatch.complete_trip(&trip.id).await.unwrap();

        let count = |recipient: &str, kind: NotificationKind| {
            h.gateway
                .sent_to(recipient)
                .into_iter()
                .filter(|n| n.kind == kind)
                .count()
        };
        assert_eq!(count("usr-250830-trv05", NotificationKind::SearchStarted), 1);
        for kind in [
            NotificationKind::RiderArriving,
            NotificationKind::RiderArrived,
            NotificationKind::OtpVerified,
            NotificationKind::TripStarted,
            NotificationKind::TripCompleted,
        ] {
            assert_eq!(count("usr-250830-trv05", kind), 1, "traveller missing {:?}", kind);
            assert_eq!(count("usr-250830-ridr5", kind), 1, "rider missing {:?}", kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_request_releases_lock_entry() {
        let h = harness().await;
        let (_, trip) = assigned_trip(&h).await;
        h.dispatch
            .heartbeat(
                "usr-250830-ridr5",
                HeartbeatRequest {
                    position: GeoPoint::new(24.37351, 92.16241),
                    status: AvailabilityStatus::OnlineIdle,
                },
            )
            .await
            .unwrap();
        let stored = h.store.get_trip(&trip.id).await.unwrap().unwrap();
        h.dispatch
            .submit_otp(&trip.id, SubmitOtpRequest { code: stored.otp })
            .await
            .unwrap();
        h.dispatch.start_trip(&trip.id).await.unwrap();
        h.dispatch.complete_trip(&trip.id).await.unwrap();
        assert!(h.dispatch.entity_locks.lock().unwrap().is_empty());

        // Cancellation during search drains its entry the same way.
        seed_user(&h.store, "usr-250830-trv11", "+919862000019", UserRole::Traveller).await;
        let submitted = h.dispatch.clone().submit_request(draft("usr-250830-trv11", 1)).await.unwrap();
        settle().await;
        h.dispatch
            .cancel(
                &submitted.request_id,
                CancelRequest {
                    actor: CancelActor::Traveller,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert!(h.dispatch.entity_locks.lock().unwrap().is_empty());
    }
}
