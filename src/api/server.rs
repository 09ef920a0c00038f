use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::storage::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::get_queue_metrics))
        .route("/tasks/runnable", get(handlers::list_runnable))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/checkpoint", get(handlers::get_checkpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the read-only admin API until `shutdown` flips to `true`.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("admin API listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
