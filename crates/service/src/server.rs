//! HTTP endpoint exposing [`ServiceStatistics`] as JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ServiceError;
use crate::host::{Microservice, ServiceStatistics};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    started: bool,
}

async fn statistics_handler(State(service): State<Arc<Microservice>>) -> Json<ServiceStatistics> {
    Json(service.statistics())
}

async fn health_handler(State(service): State<Arc<Microservice>>) -> Json<HealthResponse> {
    let started = service.is_started();
    Json(HealthResponse {
        status: if started { "ok" } else { "stopped" },
        service: service.identity().service_id.clone(),
        started,
    })
}

pub fn statistics_router(service: Arc<Microservice>) -> Router {
    Router::new()
        .route("/statistics", get(statistics_handler))
        .route("/health", get(health_handler))
        .with_state(service)
}

/// Serve on an already bound listener until `shutdown` flips to `true`.
pub async fn serve_statistics(
    listener: TcpListener,
    service: Arc<Microservice>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    axum::serve(listener, statistics_router(service))
        .with_graceful_shutdown(async move {
            let mut rx = shutdown;
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

pub fn spawn_statistics_server(
    port: u16,
    service: Arc<Microservice>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind statistics HTTP server");
                return;
            }
        };
        tracing::info!(port, "statistics HTTP server listening");
        if let Err(e) = serve_statistics(listener, service, shutdown).await {
            tracing::warn!(error = %e, "statistics HTTP server failed");
        }
        tracing::info!("statistics HTTP server stopped");
    })
}
