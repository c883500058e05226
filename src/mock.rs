//! A mock, useful to test serial port functionality without the actual serial ports.
//!
//! A [`MockBackend`] lists made-up ports and hands out scripted [`MockLink`]s
//! when they are opened.
//! A simulated link behaves like the real sensor: it announces initialization,
//! completes it, then streams data lines forever.

use std::{
    collections::{HashSet, VecDeque},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, trace};

use crate::{
    error::Error,
    frame::{SensorFrame, INIT_COMPLETE_MARKER, INIT_START_MARKER},
    recovery::Recovery,
    serial::{error::SerialPortError, Link, PortDescriptor, SerialBackend},
};

/// One scripted behaviour of a [`MockLink`].
#[derive(Debug, Clone)]
pub enum MockStep {
    /// The device prints this line.
    Line(String),

    /// The device is silent for a while.
    Wait(Duration),

    /// The next read fails with this kind of IO error.
    Fail(io::ErrorKind),

    /// The device goes away. Every read from now on fails.
    Disconnect,
}

/// What a [`MockLink`] does once its script is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Stay silent forever.
    Hang,

    /// Behave as if unplugged.
    Disconnect,

    /// Stream simulated readings.
    Simulate,
}

/// Everything done to a [`MockLink`] by its owner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkLog {
    /// DTR levels, in the order they were set.
    pub dtr: Vec<bool>,

    /// Bytes put on the wire.
    pub written: Vec<u8>,

    /// How many times input was discarded.
    pub discards: usize,
}

/// A scripted link.
#[derive(Debug)]
pub struct MockLink {
    steps: VecDeque<MockStep>,
    exhausted: Exhausted,
    period: Duration,
    counter: i64,
    fail_dtr: bool,
    fail_write: bool,
    log: Arc<Mutex<LinkLog>>,
}

impl MockLink {
    /// A link which plays the steps, then does `exhausted`.
    pub fn new(steps: Vec<MockStep>, exhausted: Exhausted) -> Self {
        Self {
            steps: steps.into(),
            exhausted,
            period: Duration::from_millis(100),
            counter: 0,
            fail_dtr: false,
            fail_write: false,
            log: Arc::default(),
        }
    }

    /// A link which prints these lines, then hangs.
    pub fn lines<S: AsRef<str>>(lines: &[S]) -> Self {
        Self::new(
            lines
                .iter()
                .map(|line| MockStep::Line(line.as_ref().to_owned()))
                .collect(),
            Exhausted::Hang,
        )
    }

    /// A well-behaved sensor.
    pub fn simulated() -> Self {
        Self::new(
            vec![
                MockStep::Line(format!("[fw] {INIT_START_MARKER}")),
                MockStep::Wait(Duration::from_millis(500)),
                MockStep::Line(format!("[fw] {INIT_COMPLETE_MARKER}")),
            ],
            Exhausted::Simulate,
        )
    }

    /// Make setting DTR fail, like on adapters without modem lines.
    pub fn with_failing_dtr(mut self) -> Self {
        self.fail_dtr = true;
        self
    }

    /// Make writes fail.
    pub fn with_failing_write(mut self) -> Self {
        self.fail_write = true;
        self
    }

    /// A handle to what happens to this link, usable after it has been moved away.
    pub fn log(&self) -> Arc<Mutex<LinkLog>> {
        self.log.clone()
    }

    fn record(&self, f: impl FnOnce(&mut LinkLog)) {
        f(&mut self.log.lock().expect("Mock log lock should not be poisoned"))
    }

    fn simulated_line(&mut self) -> String {
        self.counter += 1;

        let t = self.counter as f64 / 10.0;
        let frame = SensorFrame {
            vert: Some((t.sin() * 1000.0).round() / 100.0),
            lat: Some((t.cos() * 500.0).round() / 100.0),
            // The real firmware loses the torsion channel now and then.
            tors: (self.counter % 25 != 0).then(|| ((t / 3.0).sin() * 300.0).round() / 100.0),
            in_pos: (self.counter / 50) % 2 == 0,
            tempo_pos: (self.counter % 50) * 100,
            conteggio: self.counter,
            captured_at: Utc::now(),
        };

        frame.to_wire_line()
    }
}

#[async_trait]
impl Link for MockLink {
    fn set_dtr(&mut self, level: bool) -> Result<(), SerialPortError> {
        if self.fail_dtr {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no modem lines").into());
        }
        self.record(|log| log.dtr.push(level));
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), SerialPortError> {
        self.record(|log| log.discards += 1);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SerialPortError> {
        if self.fail_write {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.record(|log| log.written.extend_from_slice(bytes));
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError> {
        loop {
            match self.steps.pop_front() {
                Some(MockStep::Line(line)) => {
                    trace!(%line, "Mock line");
                    return Ok(Some(line));
                }
                Some(MockStep::Wait(duration)) if duration > wait => {
                    tokio::time::sleep(wait).await;
                    self.steps.push_front(MockStep::Wait(duration - wait));
                    return Ok(None);
                }
                Some(MockStep::Wait(duration)) => {
                    tokio::time::sleep(duration).await;
                }
                Some(MockStep::Fail(kind)) => return Err(io::Error::from(kind).into()),
                Some(MockStep::Disconnect) => {
                    self.steps.push_front(MockStep::Disconnect);
                    return Err(SerialPortError::Disconnected);
                }
                None => match self.exhausted {
                    Exhausted::Hang => {
                        tokio::time::sleep(wait).await;
                        return Ok(None);
                    }
                    Exhausted::Disconnect => return Err(SerialPortError::Disconnected),
                    Exhausted::Simulate => {
                        tokio::time::sleep(self.period.min(wait)).await;
                        return Ok(Some(self.simulated_line()));
                    }
                },
            }
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    ports: Vec<String>,
    unprobeable: HashSet<String>,
    links: VecDeque<MockLink>,
    simulate_when_empty: bool,
    probes: Vec<String>,
    opened: Vec<PortDescriptor>,
}

/// Made-up serial ports.
///
/// Cloning gives another handle to the same ports,
/// so tests can keep one while the supervisor owns another.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Ports with these paths exist and probe fine.
    /// Opening them yields the links pushed via [`MockBackend::push_link`].
    pub fn new<S: AsRef<str>>(ports: &[S]) -> Self {
        let backend = Self::default();
        backend.set_ports(ports);
        backend
    }

    /// A single port hosting a simulated sensor, reconnectable forever.
    pub fn simulated(path: &str) -> Self {
        let backend = Self::new(&[path]);
        backend.state().simulate_when_empty = true;
        backend
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .expect("Mock state lock should not be poisoned")
    }

    /// Replace the set of present ports, e.g. after a re-enumeration.
    pub fn set_ports<S: AsRef<str>>(&self, ports: &[S]) {
        self.state().ports = ports.iter().map(|p| p.as_ref().to_owned()).collect();
    }

    /// Whether probing this port succeeds.
    pub fn set_probe_ok(&self, path: &str, ok: bool) {
        let mut state = self.state();
        if ok {
            state.unprobeable.remove(path);
        } else {
            state.unprobeable.insert(path.to_owned());
        }
    }

    /// The next open yields this link.
    pub fn push_link(&self, link: MockLink) {
        self.state().links.push_back(link);
    }

    /// Every path probed so far.
    pub fn probes(&self) -> Vec<String> {
        self.state().probes.clone()
    }

    /// Every port opened so far.
    pub fn opened(&self) -> Vec<PortDescriptor> {
        self.state().opened.clone()
    }
}

impl SerialBackend for MockBackend {
    type Link = MockLink;

    fn candidates(&self) -> Vec<String> {
        self.state().ports.clone()
    }

    fn probe(&self, path: &str, _baud: u32) -> Result<(), SerialPortError> {
        let mut state = self.state();
        state.probes.push(path.to_owned());

        if state.ports.iter().any(|p| p == path) && !state.unprobeable.contains(path) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound).into())
        }
    }

    fn open(&self, port: &PortDescriptor) -> Result<MockLink, SerialPortError> {
        let mut state = self.state();
        state.opened.push(port.clone());

        if !state.ports.contains(&port.path) {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }

        match state.links.pop_front() {
            Some(link) => Ok(link),
            None if state.simulate_when_empty => Ok(MockLink::simulated()),
            None => Err(io::Error::from(io::ErrorKind::PermissionDenied).into()),
        }
    }
}

/// A recovery strategy which only counts how often it was asked to act.
#[derive(Debug, Clone, Default)]
pub struct CountingRecovery {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl CountingRecovery {
    /// Succeeds every time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every time.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// How many resets were requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recovery for CountingRecovery {
    async fn reset_bus(&self) -> Result<(), Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%call, "Mock bus reset");

        if self.fail {
            Err(Error::Recovery("mock recovery always fails".into()))
        } else {
            Ok(())
        }
    }
}
