use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the saarthi-dispatch coordinator
#[derive(Debug)]
pub enum DispatchError {
    // HTTP and API errors
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    InternalServer(String),

    // Validation errors
    ValidationFailed(Vec<ValidationError>),
    MissingRequiredField(String),
    InvalidFieldValue { field: String, value: String, reason: String },

    // Business logic errors
    UserNotFound(String),
    RiderNotFound(String),
    RequestNotFound(String),
    TripNotFound(String),
    /// State machine guard rejected the event; carries the state the entity
    /// is currently in so the caller can re-fetch and reconcile.
    InvalidTransition { current: String, event: String },
    /// Response to an offer that has already expired or moved to another rider.
    StaleOffer(String),
    /// The rider was never offered this request.
    NotOffered(String),
    /// Passenger count exceeds the vehicle (or vehicle type) capacity.
    CapacityExceeded { requested: u8, capacity: u8 },
    /// Matcher exhausted the candidate set. Internal signal, not surfaced to
    /// travellers as an error.
    NoCandidates,
    RiderNotAvailable(String),
    RoleSwitchBlocked(String),

    // Store and Redis errors
    RedisConnection(String),
    RedisQuery(String),
    RedisSerialization(String),

    // Network and HTTP client errors
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),
    InvalidFormat(String),

    // Notification gateway errors
    NotifyDelivery(String),

    // Configuration errors
    ConfigurationError(String),

    // Resource management errors
    ServiceUnavailable(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            DispatchError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            DispatchError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DispatchError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            DispatchError::InternalServer(msg) => write!(f, "Internal server error: {}", msg),

            DispatchError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            DispatchError::MissingRequiredField(field) => write!(f, "Missing required field: {}", field),
            DispatchError::InvalidFieldValue { field, value, reason } => {
                write!(f, "Invalid value '{}' for field '{}': {}", value, field, reason)
            }

            DispatchError::UserNotFound(id) => write!(f, "User not found: {}", id),
            DispatchError::RiderNotFound(id) => write!(f, "Rider not found: {}", id),
            DispatchError::RequestNotFound(id) => write!(f, "Ride request not found: {}", id),
            DispatchError::TripNotFound(id) => write!(f, "Trip not found: {}", id),
            DispatchError::InvalidTransition { current, event } => {
                write!(f, "Event '{}' is not valid in state '{}'", event, current)
            }
            DispatchError::StaleOffer(id) => write!(f, "Offer for request {} has expired or moved on", id),
            DispatchError::NotOffered(id) => write!(f, "Rider holds no offer for request {}", id),
            DispatchError::CapacityExceeded { requested, capacity } => {
                write!(f, "Passenger count {} exceeds vehicle capacity {}", requested, capacity)
            }
            DispatchError::NoCandidates => write!(f, "No eligible riders in search area"),
            DispatchError::RiderNotAvailable(id) => write!(f, "Rider {} is not available", id),
            DispatchError::RoleSwitchBlocked(msg) => write!(f, "Role switch blocked: {}", msg),

            DispatchError::RedisConnection(msg) => write!(f, "Redis connection error: {}", msg),
            DispatchError::RedisQuery(msg) => write!(f, "Redis query error: {}", msg),
            DispatchError::RedisSerialization(msg) => write!(f, "Redis serialization error: {}", msg),

            DispatchError::NetworkTimeout => write!(f, "Network request timed out"),
            DispatchError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            DispatchError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),

            DispatchError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            DispatchError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),
            DispatchError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),

            DispatchError::NotifyDelivery(msg) => write!(f, "Notification delivery error: {}", msg),

            DispatchError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),

            DispatchError::ServiceUnavailable(service) => write!(f, "Service unavailable: {}", service),
        }
    }
}

impl std::error::Error for DispatchError {}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, error_type, message, details) = match self {
            DispatchError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            DispatchError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            DispatchError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            DispatchError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),

            DispatchError::ValidationFailed(errors) => {
                let details = serde_json::to_value(&errors).ok();
                (StatusCode::BAD_REQUEST, "validation_failed", "Validation errors occurred".to_string(), details)
            }
            DispatchError::MissingRequiredField(field) => {
                (StatusCode::BAD_REQUEST, "missing_field", format!("Missing required field: {}", field), None)
            }
            DispatchError::InvalidFieldValue { field, value: _, reason } => {
                (StatusCode::BAD_REQUEST, "invalid_field", format!("Invalid value for {}: {}", field, reason), None)
            }

            DispatchError::UserNotFound(id) => (StatusCode::NOT_FOUND, "user_not_found", format!("User not found: {}", id), None),
            DispatchError::RiderNotFound(id) => (StatusCode::NOT_FOUND, "rider_not_found", format!("Rider not found: {}", id), None),
            DispatchError::RequestNotFound(id) => (StatusCode::NOT_FOUND, "request_not_found", format!("Ride request not found: {}", id), None),
            DispatchError::TripNotFound(id) => (StatusCode::NOT_FOUND, "trip_not_found", format!("Trip not found: {}", id), None),

            DispatchError::InvalidTransition { current, event } => {
                let details = serde_json::json!({ "current_state": current, "event": event });
                (StatusCode::CONFLICT, "invalid_transition",
                 format!("Event '{}' is not valid in state '{}'", event, current), Some(details))
            }
            DispatchError::StaleOffer(id) => {
                (StatusCode::CONFLICT, "stale_offer", format!("Offer for request {} has expired or moved on", id), None)
            }
            DispatchError::NotOffered(id) => {
                (StatusCode::CONFLICT, "not_offered", format!("Rider holds no offer for request {}", id), None)
            }
            DispatchError::CapacityExceeded { requested, capacity } => {
                let details = serde_json::json!({ "requested": requested, "capacity": capacity });
                (StatusCode::BAD_REQUEST, "capacity_exceeded",
                 format!("Passenger count {} exceeds vehicle capacity {}", requested, capacity), Some(details))
            }
            DispatchError::RiderNotAvailable(id) => {
                (StatusCode::CONFLICT, "rider_not_available", format!("Rider {} is not available", id), None)
            }
            DispatchError::RoleSwitchBlocked(msg) => {
                (StatusCode::CONFLICT, "role_switch_blocked", msg, None)
            }

            DispatchError::ServiceUnavailable(service) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", format!("Service unavailable: {}", service), None)
            }

            // NoCandidates and infrastructure errors are internal
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", self.to_string(), None),
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type DispatchResult<T> = Result<T, DispatchError>;

// Conversion implementations for common error types
impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => DispatchError::RedisConnection(err.to_string()),
            redis::ErrorKind::ResponseError => DispatchError::RedisQuery(err.to_string()),
            redis::ErrorKind::AuthenticationFailed => DispatchError::RedisConnection("Authentication failed".to_string()),
            _ => DispatchError::RedisQuery(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::NetworkTimeout
        } else if err.is_connect() {
            DispatchError::NetworkConnection(err.to_string())
        } else {
            DispatchError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() {
            DispatchError::JsonParsing(err.to_string())
        } else {
            DispatchError::JsonSerialization(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for DispatchError {
    fn from(err: chrono::ParseError) -> Self {
        DispatchError::InvalidFormat(format!("Invalid date/time format: {}", err))
    }
}

// Helper functions for creating common errors
impl DispatchError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        DispatchError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        DispatchError::Unauthorized(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        DispatchError::NotFound(resource.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        DispatchError::InternalServer(msg.into())
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn invalid_transition(current: impl Into<String>, event: impl Into<String>) -> Self {
        DispatchError::InvalidTransition {
            current: current.into(),
            event: event.into(),
        }
    }

    pub fn user_not_found(user_id: impl Into<String>) -> Self {
        DispatchError::UserNotFound(user_id.into())
    }

    pub fn rider_not_found(rider_id: impl Into<String>) -> Self {
        DispatchError::RiderNotFound(rider_id.into())
    }

    pub fn trip_not_found(trip_id: impl Into<String>) -> Self {
        DispatchError::TripNotFound(trip_id.into())
    }

    /// Whether a failed operation may be retried internally (infrastructure
    /// hiccups), as opposed to caller errors which must never be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::RedisConnection(_)
                | DispatchError::RedisQuery(_)
                | DispatchError::NetworkTimeout
                | DispatchError::NetworkConnection(_)
        )
    }
}
