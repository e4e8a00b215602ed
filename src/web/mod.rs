//! HTTP API server.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::db::Store;
use crate::events::EventBus;
use crate::notify::NotificationManager;
use crate::scheduler::Scheduler;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub notifier: Arc<NotificationManager>,
    pub bus: EventBus,
}

/// The API server.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(
        port: u16,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        notifier: Arc<NotificationManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            port,
            state: AppState {
                store,
                scheduler,
                notifier,
                bus,
            },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/devices", get(handlers::get_devices))
            .route("/api/devices", post(handlers::create_device))
            .route("/api/devices/{id}", delete(handlers::delete_device))
            .route("/api/schedules", get(handlers::get_schedules))
            .route("/api/schedules", post(handlers::update_schedule))
            .route("/api/schedule-status", get(handlers::get_schedule_status))
            .route("/api/history", get(handlers::get_history))
            .route("/api/latest", get(handlers::get_latest))
            .route("/api/run-ping", post(handlers::run_ping))
            .route("/api/run-speed", post(handlers::run_speed))
            .route("/api/queue-status", get(handlers::get_queue_status))
            .route("/api/alert-rules", get(handlers::get_alert_rules))
            .route("/api/alert-rules", post(handlers::create_alert_rule))
            .route("/api/alert-rules/{id}", put(handlers::update_alert_rule))
            .route("/api/alert-rules/{id}", delete(handlers::delete_alert_rule))
            .route("/api/notifications/settings", get(handlers::get_notification_settings))
            .route("/api/notifications/settings", put(handlers::update_notification_settings))
            .route("/api/events", get(handlers::sse_events))
            .route("/api/ws", get(handlers::ws_events))
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process exits.
    pub async fn start(&self) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("API server listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    }
}
