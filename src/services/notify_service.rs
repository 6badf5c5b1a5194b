// src/services/notify_service.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing;

use crate::errors::DispatchResult;
use crate::utils::id_generator::{IdGenerator, IdType};

/// Lifecycle events pushed to travellers and riders. One notification per
/// applied transition; delivery is at-most-once and never blocks the
/// transition that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    SearchStarted,
    OfferIssued,
    RideAssigned,
    SearchExpired,
    RiderArriving,
    RiderArrived,
    OtpReverification,
    OtpVerified,
    TripStarted,
    TripCompleted,
    TripCancelled,
    CancellationPenalty,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SearchStarted => "SEARCH_STARTED",
            NotificationKind::OfferIssued => "OFFER_ISSUED",
            NotificationKind::RideAssigned => "RIDE_ASSIGNED",
            NotificationKind::SearchExpired => "SEARCH_EXPIRED",
            NotificationKind::RiderArriving => "RIDER_ARRIVING",
            NotificationKind::RiderArrived => "RIDER_ARRIVED",
            NotificationKind::OtpReverification => "OTP_REVERIFICATION",
            NotificationKind::OtpVerified => "OTP_VERIFIED",
            NotificationKind::TripStarted => "TRIP_STARTED",
            NotificationKind::TripCompleted => "TRIP_COMPLETED",
            NotificationKind::TripCancelled => "TRIP_CANCELLED",
            NotificationKind::CancellationPenalty => "CANCELLATION_PENALTY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleNotification {
    pub id: String,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub request_id: Option<String>,
    pub trip_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl LifecycleNotification {
    pub fn new(recipient_id: &str, kind: NotificationKind) -> Self {
        Self {
            id: IdGenerator::generate(IdType::Notification),
            recipient_id: recipient_id.to_string(),
            kind,
            request_id: None,
            trip_id: None,
            payload: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn for_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn for_trip(mut self, trip_id: &str) -> Self {
        self.trip_id = Some(trip_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, notification: LifecycleNotification) -> DispatchResult<()>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook returned status {0}")]
    Rejected(reqwest::StatusCode),

    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub webhook_url: String,
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn from_env() -> Option<Self> {
        std::env::var("NOTIFY_WEBHOOK_URL").ok().map(|url| Self {
            webhook_url: url,
            timeout_secs: 5,
        })
    }
}

/// Posts each notification as JSON to a configured webhook. Delivery
/// failures are logged and swallowed so lifecycle transitions never
/// stall on a slow or broken downstream.
pub struct WebhookGateway {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookGateway {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    async fn deliver(&self, notification: &LifecycleNotification) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(notification)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Rejected(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    async fn notify(&self, notification: LifecycleNotification) -> DispatchResult<()> {
        match self.deliver(&notification).await {
            Ok(()) => {
                tracing::debug!(
                    "Delivered {} notification {} to {}",
                    notification.kind.as_str(),
                    notification.id,
                    notification.recipient_id
                );
            }
            Err(e) => {
                tracing::warn!("Webhook delivery failed for {}: {}", notification.id, e);
            }
        }
        Ok(())
    }
}

/// Logs notifications instead of delivering them. Default gateway when no
/// webhook is configured.
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn notify(&self, notification: LifecycleNotification) -> DispatchResult<()> {
        tracing::info!(
            "Notification {} for {}: {} (request={:?}, trip={:?})",
            notification.id,
            notification.recipient_id,
            notification.kind.as_str(),
            notification.request_id,
            notification.trip_id
        );
        Ok(())
    }
}

/// Records notifications in memory for inspection. Test double.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<LifecycleNotification>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<LifecycleNotification> {
        self.sent.lock().expect("recording gateway lock poisoned").clone()
    }

    pub fn sent_to(&self, recipient_id: &str) -> Vec<LifecycleNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient_id == recipient_id)
            .collect()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify(&self, notification: LifecycleNotification) -> DispatchResult<()> {
        self.sent
            .lock()
            .expect("recording gateway lock poisoned")
            .push(notification);
        Ok(())
    }
}

/// Webhook gateway when `NOTIFY_WEBHOOK_URL` is set, log-only otherwise.
pub fn gateway_from_env() -> Arc<dyn NotificationGateway> {
    match WebhookConfig::from_env() {
        Some(config) => {
            tracing::info!("Notification webhook configured: {}", config.webhook_url);
            Arc::new(WebhookGateway::new(config))
        }
        None => {
            tracing::info!("No notification webhook configured, logging notifications only");
            Arc::new(LogGateway)
        }
    }
}
