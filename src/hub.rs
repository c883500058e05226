//! Fans decoded readings and status changes out to every connected subscriber.

use std::{collections::HashMap, fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    frame::SensorFrame,
    subscriber::{Subscriber, SubscriberId},
    supervisor::FrameView,
};

/// How many envelopes a slow subscriber may fall behind before it starts missing some.
pub const BROADCAST_CAPACITY: usize = 100;

/// What the bridge knows about the device, or about a subscriber's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The device is calibrating.
    Initializing,

    /// The device is calibrated.
    Ready,

    /// Sent to a subscriber when it joins.
    Connected,
}

/// Payload of `system_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// The status.
    pub status: Status,

    /// Only set when greeting a new subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<usize>,
}

impl SystemStatus {
    /// A device status.
    pub fn device(status: Status) -> Self {
        Self {
            status,
            active_connections: None,
        }
    }

    /// The greeting for a new subscriber.
    pub fn connected(active_connections: usize) -> Self {
        Self {
            status: Status::Connected,
            active_connections: Some(active_connections),
        }
    }
}

/// Payload of `heartbeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch.
    pub server_time: i64,

    /// Subscribers connected when the heartbeat was sent.
    pub connections: usize,
}

/// Payload of `test_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResponse {
    /// Always `success`.
    pub status: String,

    /// What the subscriber sent.
    pub received: serde_json::Value,

    /// Milliseconds since the Unix epoch.
    pub server_time: i64,
}

impl TestResponse {
    /// Echo what was received.
    pub fn echo(received: serde_json::Value) -> Self {
        Self {
            status: "success".into(),
            received,
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

/// Everything sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// A new reading.
    SensorUpdate(SensorFrame),

    /// The device, or the subscriber's connection, changed status.
    SystemStatus(SystemStatus),

    /// The bridge is alive.
    Heartbeat(Heartbeat),

    /// Reply to a subscriber's test message. Only sent to that subscriber.
    TestResponse(TestResponse),
}

impl Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::SensorUpdate(frame) => write!(f, "sensor_update {frame}"),
            Envelope::SystemStatus(status) => write!(f, "system_status {:?}", status.status),
            Envelope::Heartbeat(heartbeat) => {
                write!(f, "heartbeat ({} connections)", heartbeat.connections)
            }
            Envelope::TestResponse(_) => write!(f, "test_response"),
        }
    }
}

/// Where the acquisition loop delivers what it decodes.
pub trait Sink: Send + Sync {
    /// Deliver to every subscriber.
    /// Returns how many subscribers it reached.
    fn publish(&self, envelope: Envelope) -> usize;
}

impl<T: Sink + ?Sized> Sink for Arc<T> {
    fn publish(&self, envelope: Envelope) -> usize {
        (**self).publish(envelope)
    }
}

/// A freshly joined subscriber.
#[derive(Debug)]
pub struct Subscription {
    /// Who joined.
    pub subscriber: Subscriber,

    /// Send these first, so the subscriber does not start out blank.
    pub initial: Vec<Envelope>,

    /// Everything published from now on.
    pub receiver: broadcast::Receiver<Envelope>,
}

/// The broadcast sink.
#[derive(Debug)]
pub struct Hub {
    sender: broadcast::Sender<Envelope>,
    subscribers: RwLock<HashMap<SubscriberId, SocketAddr>>,
    status: watch::Sender<Option<Status>>,
    frames: FrameView,
}

impl Hub {
    /// A hub greeting new subscribers with the last frame in `frames`.
    pub fn new(frames: FrameView) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (status, _) = watch::channel(None);

        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            status,
            frames,
        }
    }

    /// Register a subscriber.
    pub async fn join(&self, addr: SocketAddr) -> Subscription {
        // Subscribe before looking at the current state,
        // anything published in between is then seen twice instead of never.
        let receiver = self.sender.subscribe();

        let subscriber = Subscriber {
            id: SubscriberId::new(),
            addr,
        };

        let active_connections = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(subscriber.id, addr);
            subscribers.len()
        };
        info!(%subscriber, active_connections, "Subscriber joined");

        let mut initial = vec![];
        if let Some(frame) = self.frames.last_frame() {
            initial.push(Envelope::SensorUpdate(frame));
        }
        if let Some(status) = self.status() {
            initial.push(Envelope::SystemStatus(SystemStatus::device(status)));
        }
        initial.push(Envelope::SystemStatus(SystemStatus::connected(
            active_connections,
        )));

        Subscription {
            subscriber,
            initial,
            receiver,
        }
    }

    /// Unregister a subscriber. Unknown ones are ignored.
    pub async fn leave(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;

        if let Some(addr) = subscribers.remove(&id) {
            let subscriber = Subscriber { id, addr };
            info!(%subscriber, active_connections = subscribers.len(), "Subscriber left");
        }
    }

    /// How many subscribers are connected.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// The last device status published, if any.
    pub fn status(&self) -> Option<Status> {
        *self.status.borrow()
    }

    /// The readings as seen by the acquisition loop.
    pub fn frames(&self) -> &FrameView {
        &self.frames
    }
}

impl Sink for Hub {
    fn publish(&self, envelope: Envelope) -> usize {
        if let Envelope::SystemStatus(SystemStatus {
            status: status @ (Status::Initializing | Status::Ready),
            ..
        }) = &envelope
        {
            self.status.send_replace(Some(*status));
        }

        trace!(%envelope, "Publishing");

        // Failing just means nobody is listening right now.
        self.sender.send(envelope).unwrap_or(0)
    }
}

/// Periodically tell subscribers the bridge is alive.
///
/// Runs until `shutdown` is cancelled.
/// Nothing is published while nobody is connected.
pub async fn heartbeat(hub: Arc<Hub>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Heartbeat stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let connections = hub.subscriber_count().await;
        info!(connections, "Heartbeat");

        if connections > 0 {
            hub.publish(Envelope::Heartbeat(Heartbeat {
                server_time: Utc::now().timestamp_millis(),
                connections,
            }));
        }
    }
}
