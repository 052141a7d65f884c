pub mod config;
pub mod error;
pub mod status;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use websocket::{ConnectionRegistry, RelayServer};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and relay load
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connections = state.relay.registry().count().await;

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": connections,
    }))
}

/// Registers every HTTP route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/current", web::get().to(status::handlers::current))
        .route("/test", web::get().to(status::handlers::test));
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub relay: Arc<RelayServer>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        let relay = Arc::new(RelayServer::new(config.relay.clone()));
        Self {
            config: Arc::new(config),
            relay,
        }
    }

    pub fn shutdown(&self) {
        self.relay.shutdown();
    }
}
