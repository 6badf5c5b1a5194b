// src/state.rs
use std::sync::Arc;

use crate::errors::DispatchResult;
use crate::services::dispatch_service::{DispatchConfig, DispatchService};
use crate::services::geo_index::GeoIndex;
use crate::services::matcher::Matcher;
use crate::services::notify_service::{gateway_from_env, NotificationGateway};
use crate::services::rider_service::RiderService;
use crate::services::store::EntityStore;
use crate::services::user_service::UserService;

pub struct AppState {
    pub store: Arc<EntityStore>,
    pub geo_index: Arc<GeoIndex>,
    pub user_service: Arc<UserService>,
    pub rider_service: Arc<RiderService>,
    pub dispatch_service: Arc<DispatchService>,
    pub notification_gateway: Arc<dyn NotificationGateway>,
    pub config: AppConfig,
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_address: String,
    pub redis_url: Option<String>,
    pub heartbeat_staleness_secs: i64,
    pub archive_after_hours: i64,
    pub dispatch: DispatchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            heartbeat_staleness_secs: std::env::var("HEARTBEAT_STALENESS_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            archive_after_hours: std::env::var("ARCHIVE_AFTER_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl AppState {
    pub async fn new(config: AppConfig) -> DispatchResult<Self> {
        let store = match &config.redis_url {
            Some(url) => {
                tracing::info!("Entity store backed by Redis at {}", url);
                Arc::new(EntityStore::redis(url)?)
            }
            None => {
                tracing::info!("REDIS_URL not set, using in-memory entity store");
                Arc::new(EntityStore::memory())
            }
        };
        let geo_index = Arc::new(GeoIndex::new(config.heartbeat_staleness_secs));
        let matcher = Arc::new(Matcher::new(geo_index.clone(), config.dispatch.max_candidates));
        let user_service = Arc::new(UserService::new(store.clone()));
        let rider_service = Arc::new(RiderService::new(store.clone(), geo_index.clone()));
        let notification_gateway = gateway_from_env();
        let dispatch_service = Arc::new(DispatchService::new(
            store.clone(),
            matcher,
            rider_service.clone(),
            notification_gateway.clone(),
            config.dispatch.clone(),
        ));

        Ok(Self {
            store,
            geo_index,
            user_service,
            rider_service,
            dispatch_service,
            notification_gateway,
            config,
        })
    }
}
