// src/handlers/ride_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::{
    errors::DispatchResult,
    models::ride::{
        CancelRequest, RequestStatusResponse, RideRequestDraft, SubmitOtpRequest,
        SubmitOtpResponse, SubmitRequestResponse,
    },
    models::trip::TripResponse,
    state::AppState,
};

pub async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<RideRequestDraft>,
) -> DispatchResult<(StatusCode, Json<SubmitRequestResponse>)> {
    let submitted = state.dispatch_service.clone().submit_request(draft).await?;
    Ok((StatusCode::CREATED, Json(submitted)))
}

pub async fn get_request_status(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> DispatchResult<Json<RequestStatusResponse>> {
    let status = state.dispatch_service.get_request_status(&request_id).await?;
    Ok(Json(status))
}

pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Json(cancel): Json<CancelRequest>,
) -> DispatchResult<Json<RequestStatusResponse>> {
    let status = state.dispatch_service.cancel(&request_id, cancel).await?;
    Ok(Json(status))
}

pub async fn submit_otp(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<String>,
    Json(submission): Json<SubmitOtpRequest>,
) -> DispatchResult<Json<SubmitOtpResponse>> {
    let outcome = state.dispatch_service.submit_otp(&trip_id, submission).await?;
    Ok(Json(outcome))
}

pub async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<String>,
) -> DispatchResult<Json<TripResponse>> {
    let trip = state.dispatch_service.start_trip(&trip_id).await?;
    Ok(Json(trip))
}

pub async fn complete_trip(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<String>,
) -> DispatchResult<Json<TripResponse>> {
    let trip = state.dispatch_service.complete_trip(&trip_id).await?;
    Ok(Json(trip))
}
