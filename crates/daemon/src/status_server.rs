//! Status HTTP server for clipwatch
//!
//! Read-only JSON view of the scheduler for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Invalid bind address {0:?}")]
    InvalidAddress(String),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Parse the configured bind address
pub fn parse_bind_address(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Serve the status endpoint until the task is cancelled
pub async fn run_status_server(status: SharedStatus, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on http://{}/status", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobProgress;
    use crate::status::new_shared_status;
    use crate::task::ConversionTask;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.timestamp_unix_ms = 1_792_000_000_000;
            snapshot.capacity = 5;
            snapshot.running.push(ConversionTask::new(
                PathBuf::from("/watch/trip.mov"),
                PathBuf::from("/out/trip_converted.mp4"),
                5_368_709_120,
            ));
            let mut progress = JobProgress::default();
            progress.percent = 42.5;
            progress.timemark = Some("00:10:00.000000".to_string());
            progress.kbps = Some(2400.0);
            snapshot
                .progress
                .insert("/watch/trip.mov".to_string(), progress);
            snapshot.stats.completed = 3;
            snapshot.stats.failed = 1;
        }

        let app = create_status_router(status);
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");

        assert_eq!(snapshot.capacity, 5);
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.running[0].display_name, "trip.mov");
        assert_eq!(snapshot.progress["/watch/trip.mov"].percent, 42.5);
        assert_eq!(snapshot.stats.completed, 3);
        assert_eq!(snapshot.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = create_status_router(new_shared_status());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(
            parse_bind_address("127.0.0.1:7878").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 7878))
        );
        assert!(matches!(
            parse_bind_address("localhost"),
            Err(ServerError::InvalidAddress(_))
        ));
    }
}
