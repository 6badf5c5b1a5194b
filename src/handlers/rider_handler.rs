// src/handlers/rider_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    errors::DispatchResult,
    models::ride::OfferResponseRequest,
    models::vehicle::{HeartbeatRequest, RiderRegistration, RiderResponse},
    services::rider_service::RiderOperations,
    state::AppState,
};

pub async fn register_rider(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<RiderRegistration>,
) -> DispatchResult<(StatusCode, Json<RiderResponse>)> {
    let rider = state.rider_service.register_rider(registration).await?;
    Ok((StatusCode::CREATED, Json(rider)))
}

/// Heartbeats go through the dispatch coordinator rather than straight to the
/// rider service so arrival transitions fire on the same update.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(rider_id): Path<String>,
    Json(heartbeat): Json<HeartbeatRequest>,
) -> DispatchResult<StatusCode> {
    state.dispatch_service.heartbeat(&rider_id, heartbeat).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn respond_to_offer(
    State(state): State<Arc<AppState>>,
    Path(rider_id): Path<String>,
    Json(response): Json<OfferResponseRequest>,
) -> DispatchResult<Json<serde_json::Value>> {
    let outcome = state
        .dispatch_service
        .respond_to_offer(&rider_id, response)
        .await?;
    Ok(Json(match outcome {
        Some(trip) => json!({ "accepted": true, "trip": trip }),
        None => json!({ "accepted": false }),
    }))
}
