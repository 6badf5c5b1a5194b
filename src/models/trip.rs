// src/models/trip.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::errors::{DispatchError, DispatchResult};

/// Lifecycle states shared by a ride request and its trip. The request record
/// mirrors the state until assignment; from Assigned onward the trip record
/// is authoritative and the request follows it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TripState {
    Requested,
    Searching,
    Assigned,
    RiderArriving,
    RiderArrived,
    OtpVerified,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl TripState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripState::Completed | TripState::Cancelled | TripState::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TripState::Requested => "REQUESTED",
            TripState::Searching => "SEARCHING",
            TripState::Assigned => "ASSIGNED",
            TripState::RiderArriving => "RIDER_ARRIVING",
            TripState::RiderArrived => "RIDER_ARRIVED",
            TripState::OtpVerified => "OTP_VERIFIED",
            TripState::InProgress => "IN_PROGRESS",
            TripState::Completed => "COMPLETED",
            TripState::Cancelled => "CANCELLED",
            TripState::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CancelActor {
    Traveller,
    Rider,
    System,
}

impl CancelActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelActor::Traveller => "TRAVELLER",
            CancelActor::Rider => "RIDER",
            CancelActor::System => "SYSTEM",
        }
    }
}

/// Events that drive the lifecycle. Guards that need outside data (capacity, OTP
/// equality, offer bookkeeping) are checked by the caller before the event is
/// applied; the table below enforces ordering only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripEvent {
    Validated,
    OfferAccepted,
    SearchExhausted,
    RiderEnRoute,
    ReachedPickup,
    OtpMatched,
    StartConfirmed,
    EndConfirmed,
    Cancel(CancelActor),
}

impl TripEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TripEvent::Validated => "validated",
            TripEvent::OfferAccepted => "offer_accepted",
            TripEvent::SearchExhausted => "search_exhausted",
            TripEvent::RiderEnRoute => "rider_en_route",
            TripEvent::ReachedPickup => "reached_pickup",
            TripEvent::OtpMatched => "otp_matched",
            TripEvent::StartConfirmed => "start_confirmed",
            TripEvent::EndConfirmed => "end_confirmed",
            TripEvent::Cancel(_) => "cancel",
        }
    }
}

impl TripState {
    /// Apply one event. Invalid combinations return `InvalidTransition`
    /// carrying the current state, and the state is not consumed.
    pub fn apply(&self, event: TripEvent) -> DispatchResult<TripState> {
        use TripEvent::*;
        use TripState::*;

        let next = match (*self, event) {
            (Requested, Validated) => Searching,
            (Searching, OfferAccepted) => Assigned,
            (Searching, SearchExhausted) => Expired,
            (Assigned, RiderEnRoute) => RiderArriving,
            (Assigned, ReachedPickup) => RiderArrived,
            (RiderArriving, ReachedPickup) => RiderArrived,
            (RiderArrived, OtpMatched) => OtpVerified,
            (OtpVerified, StartConfirmed) => InProgress,
            (InProgress, EndConfirmed) => Completed,

            // Cancellation is reachable from every non-terminal state.
            (state, Cancel(_)) if !state.is_terminal() => Cancelled,

            (state, event) => {
                return Err(DispatchError::invalid_transition(state.as_str(), event.name()));
            }
        };
        Ok(next)
    }
}

/// The realized instance of an accepted ride request. Created at assignment,
/// immutable once a terminal state is reached.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Trip {
    pub id: String,
    pub ride_request_id: String,
    pub rider_id: String,
    pub traveller_id: String,
    pub otp: String,             // 4 digits, generated once at assignment
    pub state: TripState,
    pub pickup_reached_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<CancelActor>,
    pub cancel_reason: Option<String>,
    pub fare_final: Option<f64>, // quoted fare, finalized at completion
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TripResponse {
    pub id: String,
    pub ride_request_id: String,
    pub rider_id: String,
    pub traveller_id: String,
    pub state: TripState,
    pub pickup_reached_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<CancelActor>,
    pub cancel_reason: Option<String>,
    pub fare_final: Option<f64>,
}

impl From<Trip> for TripResponse {
    fn from(trip: Trip) -> Self {
        Self {
            id: trip.id,
            ride_request_id: trip.ride_request_id,
            rider_id: trip.rider_id,
            traveller_id: trip.traveller_id,
            state: trip.state,
            pickup_reached_at: trip.pickup_reached_at,
            started_at: trip.started_at,
            completed_at: trip.completed_at,
            cancelled_by: trip.cancelled_by,
            cancel_reason: trip.cancel_reason,
            fare_final: trip.fare_final,
        }
    }
}
