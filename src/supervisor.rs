//! The acquisition loop: find the sensor, talk to it, and start over whenever that fails.

use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, Timings},
    frame::{ControlEvent, SensorFrame},
    hub::{Envelope, Sink, Status, SystemStatus},
    recovery::Recovery,
    resolver::PortResolver,
    serial::{PortDescriptor, SerialBackend},
    session::{LinkSession, SessionEvent, SessionPhase},
};

/// Where the acquisition loop is at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    /// Looking for a port.
    Resolving,

    /// A port was found and is being opened.
    Opening(PortDescriptor),

    /// The device on the port is initializing.
    AwaitingInit(PortDescriptor),

    /// The device on the port is streaming.
    Streaming(PortDescriptor),

    /// Waiting before trying again.
    CoolingDown(Duration),
}

impl Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Resolving => write!(f, "resolving"),
            SupervisorState::Opening(port) => write!(f, "opening {port}"),
            SupervisorState::AwaitingInit(port) => write!(f, "awaiting init on {port}"),
            SupervisorState::Streaming(port) => write!(f, "streaming from {port}"),
            SupervisorState::CoolingDown(delay) => write!(f, "cooling down for {delay:?}"),
        }
    }
}

/// What happened while in some [`SupervisorState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The resolver found a port.
    Resolved(PortDescriptor),

    /// The resolver found nothing.
    NotFound,

    /// The session on the port moved on.
    Session(SessionPhase),

    /// The port could not be opened, or its session is over.
    Ended,

    /// The cool down elapsed.
    CooledDown,
}

impl SupervisorState {
    /// The state following `outcome`.
    ///
    /// Outcomes which make no sense in the current state leave it unchanged.
    pub fn next(&self, outcome: Outcome, timings: &Timings) -> SupervisorState {
        use SupervisorState::*;

        match (self, outcome) {
            (Resolving, Outcome::Resolved(port)) => Opening(port),
            (Resolving, Outcome::NotFound) => CoolingDown(timings.resolve_backoff()),

            (Opening(port) | AwaitingInit(port), Outcome::Session(SessionPhase::AwaitingInit)) => {
                AwaitingInit(port.clone())
            }
            (
                Opening(port) | AwaitingInit(port) | Streaming(port),
                Outcome::Session(SessionPhase::Streaming),
            ) => Streaming(port.clone()),

            (Opening(_) | AwaitingInit(_) | Streaming(_), Outcome::Ended) => {
                CoolingDown(timings.failure_cooldown())
            }

            (CoolingDown(_), Outcome::CooledDown) => Resolving,

            (state, _) => state.clone(),
        }
    }
}

/// Read access to the last reading, from anywhere.
#[derive(Debug, Clone)]
pub struct FrameView {
    receiver: watch::Receiver<Option<SensorFrame>>,
}

impl FrameView {
    /// The last reading, if there ever was one.
    pub fn last_frame(&self) -> Option<SensorFrame> {
        self.receiver.borrow().clone()
    }

    /// When the last reading was decoded.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.receiver
            .borrow()
            .as_ref()
            .map(|frame| frame.captured_at)
    }

    /// Wait for the next reading.
    pub async fn changed(&mut self) -> Option<SensorFrame> {
        self.receiver.changed().await.ok()?;
        self.last_frame()
    }
}

/// The working state of the acquisition loop.
///
/// Only the loop writes it. The last reading outlives link drops.
#[derive(Debug)]
pub struct ConnectionState {
    port: Option<PortDescriptor>,
    consecutive_failures: u32,
    last_frame: watch::Sender<Option<SensorFrame>>,
}

impl ConnectionState {
    /// A blank state, and a view of its readings.
    pub fn new() -> (Self, FrameView) {
        let (last_frame, receiver) = watch::channel(None);

        (
            Self {
                port: None,
                consecutive_failures: 0,
                last_frame,
            },
            FrameView { receiver },
        )
    }

    /// The port currently in use.
    pub fn port(&self) -> Option<&PortDescriptor> {
        self.port.as_ref()
    }

    /// Failed attempts since the device last worked.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Replace the last reading.
    ///
    /// Readings alone do not prove the device works, only streaming resets the failure count.
    pub fn record_frame(&mut self, frame: SensorFrame) {
        self.last_frame.send_replace(Some(frame));
    }
}

/// Runs the acquisition loop over some serial backend.
pub struct Supervisor<B, S, R> {
    backend: B,
    resolver: PortResolver,
    sink: S,
    recovery: R,
    recover_after: Option<u32>,
    timings: Timings,
    state: SupervisorState,
    connection: ConnectionState,
}

impl<B, S, R> Supervisor<B, S, R>
where
    B: SerialBackend,
    S: Sink,
    R: Recovery,
{
    /// A supervisor starting out resolving.
    /// Readings go to `sink` and into `connection`.
    pub fn new(backend: B, sink: S, recovery: R, config: &Config, connection: ConnectionState) -> Self {
        Self {
            backend,
            resolver: PortResolver::new(&config.serial.path_prefixes, config.serial.baud),
            sink,
            recovery,
            recover_after: config
                .recovery
                .enabled
                .then_some(config.recovery.after_failures),
            timings: config.timings.clone(),
            state: SupervisorState::Resolving,
            connection,
        }
    }

    /// The current state.
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// The working state.
    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    fn transition(&mut self, outcome: Outcome) {
        let next = self.state.next(outcome, &self.timings);
        debug!(from = %self.state, to = %next, "Transition");
        self.state = next;
    }

    /// Act on the current state once, then move on.
    ///
    /// Running a session counts as a single step, however long it streams.
    pub async fn step(&mut self, shutdown: &CancellationToken) {
        match self.state.clone() {
            SupervisorState::Resolving => match self.resolver.resolve(&self.backend) {
                Some(port) => {
                    self.connection.port = Some(port.clone());
                    self.transition(Outcome::Resolved(port));
                }
                None => {
                    info!("No sensor port found");
                    self.failed().await;
                    self.transition(Outcome::NotFound);
                }
            },
            SupervisorState::Opening(port) => {
                let clean_exit = self.run_session(port, shutdown).await;

                // Never reuse a port which failed, it gets resolved afresh.
                self.connection.port = None;
                if !clean_exit {
                    self.failed().await;
                }
                self.transition(Outcome::Ended);
            }
            SupervisorState::AwaitingInit(_) | SupervisorState::Streaming(_) => {
                // Sessions run to completion within `Opening`.
                self.transition(Outcome::Ended);
            }
            SupervisorState::CoolingDown(delay) => {
                tokio::time::sleep(delay).await;
                self.transition(Outcome::CooledDown);
            }
        }
    }

    /// Returns whether the session ended without failing.
    async fn run_session(&mut self, port: PortDescriptor, shutdown: &CancellationToken) -> bool {
        let link = match self.backend.open(&port) {
            Ok(link) => link,
            Err(e) => {
                warn!(%port, %e, "Could not open port");
                return false;
            }
        };
        info!(%port, "Port opened");

        let session = LinkSession::new(link, port, self.timings.clone());

        let state = &mut self.state;
        let connection = &mut self.connection;
        let sink = &self.sink;
        let timings = &self.timings;

        let result = session
            .run(shutdown, |event| {
                forward(event, state, connection, sink, timings)
            })
            .await;

        result.is_ok()
    }

    async fn failed(&mut self) {
        self.connection.consecutive_failures += 1;
        let failures = self.connection.consecutive_failures;

        debug!(failures, "Attempt failed");

        let Some(threshold) = self.recover_after else {
            return;
        };

        if failures % threshold == 0 {
            warn!(failures, "Too many failures in a row, attempting recovery");

            if let Err(e) = self.recovery.reset_bus().await {
                error!(%e, "Recovery failed");
            }
        }
    }

    /// Step until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Acquisition started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.step(&shutdown) => {}
            }
        }

        info!("Acquisition stopped");
    }
}

impl<B, S, R> Supervisor<B, S, R>
where
    B: SerialBackend + 'static,
    S: Sink + 'static,
    R: Recovery + 'static,
{
    /// Run on a separate task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

fn forward<S: Sink>(
    event: SessionEvent,
    state: &mut SupervisorState,
    connection: &mut ConnectionState,
    sink: &S,
    timings: &Timings,
) {
    match event {
        SessionEvent::Phase(phase) => {
            if phase == SessionPhase::Streaming {
                connection.consecutive_failures = 0;
            }

            let next = state.next(Outcome::Session(phase), timings);
            if next != *state {
                debug!(from = %state, to = %next, "Transition");
                *state = next;
            }
        }
        SessionEvent::Frame(frame) => {
            connection.record_frame(frame.clone());
            sink.publish(Envelope::SensorUpdate(frame));
        }
        SessionEvent::Control(event) => {
            let status = match event {
                ControlEvent::InitStarted => Status::Initializing,
                ControlEvent::InitComplete => Status::Ready,
            };
            sink.publish(Envelope::SystemStatus(SystemStatus::device(status)));
        }
    }
}
