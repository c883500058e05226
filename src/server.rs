use std::{net::SocketAddr, sync::Arc};

use axum::{response::IntoResponse, routing::get, Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    error::Error,
    frame::SensorFrame,
    hub::{Envelope, Hub, Sink},
    websocket,
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 5000;

/// Answer to `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Connected subscribers.
    pub active_connections: usize,

    /// When the last reading was decoded, if ever.
    pub last_data_update: Option<DateTime<Utc>>,

    /// Now, as seen by the bridge.
    pub server_time: DateTime<Utc>,

    /// The last reading, if any.
    pub sensor_data: Option<SensorFrame>,
}

/// The reading `GET /debug` publishes.
pub fn test_frame() -> SensorFrame {
    SensorFrame {
        vert: Some(12.3),
        lat: Some(-4.5),
        tors: Some(7.8),
        in_pos: true,
        tempo_pos: 1234,
        conteggio: 42,
        captured_at: Utc::now(),
    }
}

fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/status", get(show_status))
        .route("/debug", get(send_test_frame))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket needs to be able to reach the hub
                .layer(Extension(hub)),
        )
}

async fn run(
    config: ServerConfig,
    hub: Arc<Hub>,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr = SocketAddr::new(config.bind, port.unwrap_or(0));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Server(format!("Could not bind {addr}: {e}")))?
        .serve(router(hub).into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody wanted to know the allocated port");
        }
    }

    info!("listening on {}", addr);

    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Server(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    config: ServerConfig,
    hub: Arc<Hub>,
    allocated_port: oneshot::Sender<u16>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    run(config, hub, None, Some(allocated_port), shutdown).await
}

/// Start the server on the given port.
pub async fn run_on_port(
    config: ServerConfig,
    hub: Arc<Hub>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    run(config, hub, Some(port), None, shutdown).await
}

async fn status_report(hub: &Hub) -> StatusReport {
    StatusReport {
        active_connections: hub.subscriber_count().await,
        last_data_update: hub.frames().last_update(),
        server_time: Utc::now(),
        sensor_data: hub.frames().last_frame(),
    }
}

async fn show_status(Extension(hub): Extension<Arc<Hub>>) -> impl IntoResponse {
    Json(status_report(&hub).await)
}

async fn send_test_frame(Extension(hub): Extension<Arc<Hub>>) -> impl IntoResponse {
    // Bypasses the acquisition loop, so the last reading stays untouched.
    hub.publish(Envelope::SensorUpdate(test_frame()));

    let clients = hub.subscriber_count().await;
    info!(clients, "Test frame published");

    format!("Test event sent to {clients} clients")
}

async fn show_version() -> impl IntoResponse {
    format!("Sensor Bridge v{}\n", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::supervisor::ConnectionState;

    #[tokio::test]
    async fn status_without_readings() {
        let (_state, frames) = ConnectionState::new();
        let hub = Hub::new(frames);
        let _subscription = hub.join(SocketAddr::from(([127, 0, 0, 1], 1))).await;

        let report = status_report(&hub).await;

        assert_eq!(report.active_connections, 1);
        assert_eq!(report.last_data_update, None);
        assert_eq!(report.sensor_data, None);
    }

    #[tokio::test]
    async fn status_with_reading() {
        let (mut state, frames) = ConnectionState::new();
        let hub = Hub::new(frames);

        let frame = test_frame();
        state.record_frame(frame.clone());

        let report = status_report(&hub).await;

        assert_eq!(report.last_data_update, Some(frame.captured_at));
        assert_eq!(report.sensor_data, Some(frame));
    }

    #[tokio::test]
    async fn debug_does_not_touch_the_last_reading() {
        let (_state, frames) = ConnectionState::new();
        let hub = Arc::new(Hub::new(frames));
        let mut subscription = hub.join(SocketAddr::from(([127, 0, 0, 1], 1))).await;

        let reply = send_test_frame(Extension(hub.clone()))
            .await
            .into_response();
        assert!(reply.status().is_success());

        match subscription.receiver.recv().await.unwrap() {
            Envelope::SensorUpdate(frame) => assert_eq!(frame.conteggio, 42),
            other => panic!("Expected the test frame, got {other}"),
        }
        assert_eq!(hub.frames().last_frame(), None);
    }
}
