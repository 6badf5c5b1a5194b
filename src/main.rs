use axum::{
    routing::{get, post},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use saarthi_dispatch::{
    handlers::{ride_handler, rider_handler, user_handler},
    state::{AppConfig, AppState},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "saarthi_dispatch=debug,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::default();
    let bind_address = config.bind_address.clone();
    let app_state = match AppState::new(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("Failed to initialise application state: {}", e);
            std::process::exit(1);
        }
    };

    spawn_maintenance_tasks(app_state.clone());

    let app = Router::new()
        .route("/users", post(user_handler::create_user))
        .route("/users/:id", get(user_handler::get_user))
        .route("/users/:id/switch-role", post(user_handler::switch_role))
        .route("/riders", post(rider_handler::register_rider))
        .route("/riders/:id/heartbeat", post(rider_handler::heartbeat))
        .route("/riders/:id/respond", post(rider_handler::respond_to_offer))
        .route("/rides", post(ride_handler::submit_request))
        .route("/rides/:id", get(ride_handler::get_request_status))
        .route("/rides/:id/cancel", post(ride_handler::cancel_request))
        .route("/trips/:id/otp", post(ride_handler::submit_otp))
        .route("/trips/:id/start", post(ride_handler::start_trip))
        .route("/trips/:id/complete", post(ride_handler::complete_trip))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    tracing::info!("Dispatch coordinator listening on {}", bind_address);
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Background hygiene: drop geo entries whose heartbeats went stale, and move
/// old terminal requests/trips into the archive namespace.
fn spawn_maintenance_tasks(state: Arc<AppState>) {
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let removed = state.geo_index.sweep_stale(Utc::now());
                if removed > 0 {
                    tracing::debug!("Swept {} stale geo index entries", removed);
                }
            }
        });
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - ChronoDuration::hours(state.config.archive_after_hours);
            match state.store.archive_terminal_before(cutoff).await {
                Ok(archived) if archived > 0 => {
                    tracing::info!("Archived {} terminal records", archived);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Archival sweep failed: {}", e),
            }
        }
    });
}
