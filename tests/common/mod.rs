#![allow(dead_code)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::SinkExt;
use futures::StreamExt;
use sensor_bridge::{
    config::Config,
    hub::{Envelope, Hub},
    mock::MockBackend,
    recovery::NoRecovery,
    server,
    supervisor::{ConnectionState, Supervisor},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running bridge, stopped when dropped.
pub struct Bridge {
    pub port: u16,
    pub hub: Arc<Hub>,
    pub backend: MockBackend,
    shutdown: CancellationToken,
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// No serial ports at all.
pub async fn start_without_device() -> Result<Bridge> {
    start(MockBackend::new::<&str>(&[])).await
}

/// A simulated sensor on a single port.
pub async fn start_with_device() -> Result<Bridge> {
    start(MockBackend::simulated("/dev/ttyACM0")).await
}

pub async fn start(backend: MockBackend) -> Result<Bridge> {
    let mut config = Config::default();
    config.server.bind = IpAddr::from([127, 0, 0, 1]);

    let shutdown = CancellationToken::new();
    let (connection, frames) = ConnectionState::new();
    let hub = Arc::new(Hub::new(frames));

    Supervisor::new(backend.clone(), hub.clone(), NoRecovery, &config, connection)
        .spawn(shutdown.clone());

    let (port_tx, port_rx) = oneshot::channel();
    tokio::spawn(server::run_any_port(
        config.server.clone(),
        hub.clone(),
        port_tx,
        shutdown.clone(),
    ));
    let port = port_rx.await?;

    Ok(Bridge {
        port,
        hub,
        backend,
        shutdown,
    })
}

pub async fn connect(bridge: &Bridge) -> Result<Client> {
    let port = bridge.port;

    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn receive(client: &mut Client) -> Result<Envelope> {
    let message = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    let message = message.to_text()?;
    let envelope = serde_json::from_str(message)?;

    Ok(envelope)
}

/// Receive until an envelope matches, skipping the rest.
pub async fn receive_until<F>(client: &mut Client, mut matches: F) -> Result<Envelope>
where
    F: FnMut(&Envelope) -> bool,
{
    loop {
        let envelope = receive(client).await?;
        if matches(&envelope) {
            return Ok(envelope);
        }
    }
}

pub async fn send(client: &mut Client, to_send: String) -> Result<()> {
    client.send(tungstenite::Message::Text(to_send)).await?;
    Ok(())
}

/// A bare bones HTTP GET, returning the status code and body.
pub async fn get(bridge: &Bridge, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(("127.0.0.1", bridge.port)).await?;
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await?;

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await??;

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| color_eyre::eyre::eyre!("No HTTP body in {response:?}"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| color_eyre::eyre::eyre!("No HTTP status in {head:?}"))?
        .parse()?;

    Ok((status, body.to_owned()))
}

/// Poll until the condition holds, or give up after a few seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(color_eyre::eyre::eyre!("Condition never held"))
}
