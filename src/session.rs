//! One connection attempt to the sensor, from freshly opened to closed.

use std::fmt::Display;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    config::Timings,
    error::Error,
    frame::{self, ControlEvent, DecodedEvent, Kind, SensorFrame},
    serial::{Link, PortDescriptor},
};

/// The stimulus making the firmware start talking after a reset.
pub const WAKE_BYTES: &[u8] = b"\n";

/// Where a [`LinkSession`] is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// The port is open, nothing was done with it yet.
    Opened,

    /// The device was reset and poked.
    Woken,

    /// Waiting for the device to report `INIT_COMPLETE`.
    AwaitingInit,

    /// The device is calibrated and streaming.
    Streaming,

    /// The session is over.
    Closed,
}

impl Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            SessionPhase::Opened => "opened",
            SessionPhase::Woken => "woken",
            SessionPhase::AwaitingInit => "awaiting init",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Closed => "closed",
        };
        write!(f, "{phase}")
    }
}

/// What a session reports to its owner while running.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved on.
    Phase(SessionPhase),

    /// A reading arrived.
    Frame(SensorFrame),

    /// The device printed a lifecycle marker.
    Control(ControlEvent),
}

/// Drives one opened link.
///
/// The link is dropped (and thereby closed) together with the session.
pub struct LinkSession<L: Link> {
    link: L,
    port: PortDescriptor,
    timings: Timings,
    phase: SessionPhase,
}

impl<L: Link> LinkSession<L> {
    /// A session over a link just opened on `port`.
    pub fn new(link: L, port: PortDescriptor, timings: Timings) -> Self {
        Self {
            link,
            port,
            timings,
            phase: SessionPhase::Opened,
        }
    }

    /// Run until the link fails, the device never finishes initializing,
    /// or `shutdown` is cancelled.
    ///
    /// Cancellation is not a failure and yields `Ok(())`.
    /// Every other way out is an error, since a healthy link streams forever.
    pub async fn run<F>(self, shutdown: &CancellationToken, on_event: F) -> Result<(), Error>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let span = info_span!("session", port = %self.port);
        self.run_inner(shutdown, on_event).instrument(span).await
    }

    async fn run_inner<F>(mut self, shutdown: &CancellationToken, mut on_event: F) -> Result<(), Error>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Session cancelled");
                Ok(())
            }
            result = self.drive(&mut on_event) => result,
        };

        if let Err(e) = &result {
            warn!(phase = %self.phase, %e, "Session ended");
        }

        self.enter(SessionPhase::Closed, &mut on_event);

        result
    }

    async fn drive<F>(&mut self, on_event: &mut F) -> Result<(), Error>
    where
        F: FnMut(SessionEvent) + Send,
    {
        self.wake().await?;
        self.enter(SessionPhase::Woken, on_event);

        self.enter(SessionPhase::AwaitingInit, on_event);
        self.await_init(on_event).await?;
        self.enter(SessionPhase::Streaming, on_event);

        self.stream(on_event).await
    }

    fn enter<F: FnMut(SessionEvent)>(&mut self, phase: SessionPhase, on_event: &mut F) {
        debug!(from = %self.phase, to = %phase, "Session phase");
        self.phase = phase;
        on_event(SessionEvent::Phase(phase));
    }

    /// Soft reset through DTR, drop whatever the device printed before, then poke it.
    async fn wake(&mut self) -> Result<(), Error> {
        let settle = self.timings.dtr_settle();

        for level in [false, true] {
            if let Err(e) = self.link.set_dtr(level) {
                // Some adapters have no modem lines, the device may still work.
                warn!(level, %e, "Could not set DTR");
            }
            tokio::time::sleep(settle).await;
        }

        if let Err(e) = self.link.discard_input() {
            warn!(%e, "Could not discard stale input");
        }

        self.link.write(WAKE_BYTES).await?;
        debug!("Wake stimulus sent");

        Ok(())
    }

    async fn await_init<F>(&mut self, on_event: &mut F) -> Result<(), Error>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let window = self.timings.init_window();
        let deadline = Instant::now() + window;

        info!(?window, "Waiting for the device to initialize");

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::InitTimeout(window));
            }

            let wait = self.timings.read_timeout().min(deadline - now);

            if let Some(line) = self.next_line(wait).await? {
                if self.handle(&line, on_event) == Some(ControlEvent::InitComplete) {
                    info!("Device initialized");
                    return Ok(());
                }
            }
        }
    }

    async fn stream<F>(&mut self, on_event: &mut F) -> Result<(), Error>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let wait = self.timings.read_timeout();

        loop {
            if let Some(line) = self.next_line(wait).await? {
                if let Some(event) = self.handle(&line, on_event) {
                    info!(%event, "Device re-initializing");
                }
            }
        }
    }

    async fn next_line(&mut self, wait: std::time::Duration) -> Result<Option<String>, Error> {
        match self.link.read_line(wait).await {
            Ok(line) => Ok(line),
            Err(e) if e.is_transient() => {
                debug!(%e, "Transient read error");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forward whatever the line decodes to. Returns the control event, if it was one.
    fn handle<F: FnMut(SessionEvent)>(&mut self, line: &str, on_event: &mut F) -> Option<ControlEvent> {
        if line.trim().is_empty() {
            return None;
        }

        match frame::decode(line) {
            DecodedEvent::Frame(frame) => {
                trace!(%frame, "Frame");
                on_event(SessionEvent::Frame(frame));
                None
            }
            DecodedEvent::Control(event) => {
                info!(%event, phase = %self.phase, "Control marker");
                on_event(SessionEvent::Control(event));
                Some(event)
            }
            DecodedEvent::Unrecognized(unrecognized) => {
                match unrecognized.kind() {
                    Kind::NumericLike => {
                        debug!(line = %unrecognized.line, reason = ?unrecognized.reason, "Numeric-like line ignored")
                    }
                    Kind::Noise => trace!(line = %unrecognized.line, "Noise ignored"),
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::{Exhausted, MockLink, MockStep};

    fn port() -> PortDescriptor {
        PortDescriptor::new("/dev/ttyACM0", 115_200)
    }

    async fn run(link: MockLink) -> (Result<(), Error>, Vec<SessionEvent>) {
        let mut events = vec![];
        let result = LinkSession::new(link, port(), Timings::default())
            .run(&CancellationToken::new(), |event| events.push(event))
            .await;
        (result, events)
    }

    fn phases(events: &[SessionEvent]) -> Vec<SessionPhase> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Phase(phase) => Some(*phase),
                _ => None,
            })
            .collect()
    }

    fn frames(events: &[SessionEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Frame(frame) => Some(frame.conteggio),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_and_never_streams() {
        let start = Instant::now();
        let (result, events) = run(MockLink::lines::<&str>(&[])).await;

        assert!(matches!(result, Err(Error::InitTimeout(_))));
        assert!(!phases(&events).contains(&SessionPhase::Streaming));
        assert_eq!(phases(&events).last(), Some(&SessionPhase::Closed));

        // Two DTR settles, then the whole window.
        assert!(start.elapsed() >= Duration::from_secs(121));
        assert!(start.elapsed() < Duration::from_secs(123));
    }

    #[tokio::test(start_paused = true)]
    async fn init_start_alone_does_not_advance() {
        let (result, events) = run(MockLink::lines(&["INIT_START"])).await;

        assert!(matches!(result, Err(Error::InitTimeout(_))));
        assert!(events.contains(&SessionEvent::Control(ControlEvent::InitStarted)));
        assert!(!phases(&events).contains(&SessionPhase::Streaming));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_then_streaming() {
        let link = MockLink::new(
            vec![
                MockStep::Line("boot banner".into()),
                MockStep::Line("INIT_START".into()),
                MockStep::Wait(Duration::from_secs(30)),
                MockStep::Line("INIT_COMPLETE".into()),
                MockStep::Line("DATA,1.0,2.0,3.0,1,500,7".into()),
                MockStep::Line("".into()),
                MockStep::Line("DATA,1.0,2.0,NaN,0,0,8".into()),
            ],
            Exhausted::Disconnect,
        );
        let log = link.log();

        let (result, events) = run(link).await;

        assert!(matches!(result, Err(Error::Serial(_))));
        assert_eq!(
            phases(&events),
            vec![
                SessionPhase::Woken,
                SessionPhase::AwaitingInit,
                SessionPhase::Streaming,
                SessionPhase::Closed
            ]
        );
        assert_eq!(frames(&events), vec![7, 8]);

        let log = log.lock().unwrap();
        assert_eq!(log.dtr, vec![false, true]);
        assert_eq!(log.written, WAKE_BYTES);
        assert_eq!(log.discards, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn data_before_init_complete_is_forwarded() {
        let link = MockLink::new(
            vec![
                MockStep::Line("DATA,1.0,2.0,3.0,1,500,1".into()),
                MockStep::Line("INIT_COMPLETE".into()),
            ],
            Exhausted::Disconnect,
        );

        let (_, events) = run(link).await;

        assert_eq!(frames(&events), vec![1]);
        let frame_at = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Frame(_)))
            .unwrap();
        let streaming_at = events
            .iter()
            .position(|e| e == &SessionEvent::Phase(SessionPhase::Streaming))
            .unwrap();
        assert!(frame_at < streaming_at);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_markers_are_forwarded_without_restart() {
        let link = MockLink::new(
            vec![
                MockStep::Line("INIT_COMPLETE".into()),
                MockStep::Line("DATA,1,2,3,1,0,1".into()),
                MockStep::Line("INIT_START".into()),
                MockStep::Line("INIT_COMPLETE".into()),
                MockStep::Line("DATA,1,2,3,1,0,2".into()),
            ],
            Exhausted::Disconnect,
        );

        let (_, events) = run(link).await;

        assert_eq!(frames(&events), vec![1, 2]);
        assert_eq!(
            phases(&events)
                .iter()
                .filter(|p| **p == SessionPhase::Streaming)
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Control(_)))
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_end_the_session() {
        let link = MockLink::new(
            vec![
                MockStep::Line("INIT_COMPLETE".into()),
                MockStep::Fail(io::ErrorKind::TimedOut),
                MockStep::Line("DATA,1,2,3,1,0,1".into()),
                MockStep::Fail(io::ErrorKind::Interrupted),
                MockStep::Line("DATA,1,2,3,1,0,2".into()),
                MockStep::Fail(io::ErrorKind::BrokenPipe),
                MockStep::Line("DATA,1,2,3,1,0,3".into()),
            ],
            Exhausted::Hang,
        );

        let (result, events) = run(link).await;

        assert!(matches!(result, Err(Error::Serial(_))));
        assert_eq!(frames(&events), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_never_data() {
        let link = MockLink::new(
            vec![
                MockStep::Line("INIT_COMPLETE".into()),
                MockStep::Line("DATA,1,2,3,4,5".into()),
                MockStep::Line("temperature 23.5 C, humidity 40".into()),
                MockStep::Line("\u{fffd}\u{fffd}".into()),
                MockStep::Line("DATA,1,2,3,yes,0,1".into()),
            ],
            Exhausted::Disconnect,
        );

        let (_, events) = run(link).await;

        assert!(frames(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_dtr_is_ignored() {
        let link = MockLink::new(
            vec![MockStep::Line("INIT_COMPLETE".into())],
            Exhausted::Disconnect,
        )
        .with_failing_dtr();
        let log = link.log();

        let (_, events) = run(link).await;

        assert!(phases(&events).contains(&SessionPhase::Streaming));
        assert_eq!(log.lock().unwrap().written, WAKE_BYTES);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_wake_write_is_fatal() {
        let link = MockLink::lines(&["INIT_COMPLETE"]).with_failing_write();

        let (result, events) = run(link).await;

        assert!(matches!(result, Err(Error::Serial(_))));
        assert_eq!(phases(&events), vec![SessionPhase::Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_an_error() {
        let shutdown = CancellationToken::new();
        let session = LinkSession::new(MockLink::simulated(), port(), Timings::default());

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });

        let mut frames = 0;
        let result = session
            .run(&shutdown, |event| {
                if matches!(event, SessionEvent::Frame(_)) {
                    frames += 1;
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(frames > 0);
    }
}
