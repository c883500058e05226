//! Decoding of the text lines the sensor firmware prints.
//!
//! Three kinds of lines exist on the wire:
//!
//! - Data lines: `DATA,<vert>,<lat>,<tors>,<inPos 0|1>,<tempoPos>,<conteggio>`.
//! - Control lines: anything containing `INIT_START` or `INIT_COMPLETE`.
//!   The markers are matched anywhere in the line, since the firmware may
//!   prefix them with its own framing.
//! - Everything else, which is firmware chatter and never treated as data.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every data line.
pub const DATA_CODEWORD: &str = "DATA";

/// The firmware started its calibration.
pub const INIT_START_MARKER: &str = "INIT_START";

/// The firmware is calibrated and streaming.
pub const INIT_COMPLETE_MARKER: &str = "INIT_COMPLETE";

/// Number of comma separated fields after the codeword.
pub const DATA_FIELDS: usize = 6;

/// Unrecognized lines at least this long containing a digit
/// are reported as numeric-like instead of noise.
const NUMERIC_LIKE_MIN_LENGTH: usize = 10;

/// One decoded sensor reading.
///
/// A channel is `None` when the device sent something unparsable or non-finite.
/// That is not the same as a zero reading, and is serialized as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFrame {
    /// Vertical channel.
    pub vert: Option<f64>,

    /// Lateral channel.
    pub lat: Option<f64>,

    /// Torsional channel.
    pub tors: Option<f64>,

    /// Whether the subject is within the target position.
    pub in_pos: bool,

    /// Time spent in position, as reported by the device.
    pub tempo_pos: i64,

    /// Repetition counter.
    pub conteggio: i64,

    /// When this bridge decoded the line.
    pub captured_at: DateTime<Utc>,
}

impl SensorFrame {
    /// Encode the frame as a wire line (without the newline).
    /// Absent channels are written as `nan`, which decodes back to absent.
    pub fn to_wire_line(&self) -> String {
        fn channel(value: Option<f64>) -> String {
            value.map_or_else(|| "nan".to_owned(), |v| v.to_string())
        }

        format!(
            "{DATA_CODEWORD},{},{},{},{},{},{}",
            channel(self.vert),
            channel(self.lat),
            channel(self.tors),
            u8::from(self.in_pos),
            self.tempo_pos,
            self.conteggio
        )
    }
}

impl Display for SensorFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} vert={:?} lat={:?} tors={:?} in_pos={} tempo_pos={}",
            self.conteggio, self.vert, self.lat, self.tors, self.in_pos, self.tempo_pos
        )
    }
}

/// Device lifecycle markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// Calibration started.
    InitStarted,

    /// Calibration done, data is meaningful.
    InitComplete,
}

impl Display for ControlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlEvent::InitStarted => write!(f, "{INIT_START_MARKER}"),
            ControlEvent::InitComplete => write!(f, "{INIT_COMPLETE_MARKER}"),
        }
    }
}

/// Why a line did not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Neither a control marker nor a data codeword.
    NotData,

    /// A data line with the wrong number of fields.
    WrongFieldCount(usize),

    /// A field which must be an integer was not.
    BadInteger(&'static str),
}

/// Kind of unrecognized line, only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Looks like it could have been a reading.
    NumericLike,

    /// Anything else.
    Noise,
}

/// A line that was neither data nor control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedLine {
    /// The offending line.
    pub line: String,

    /// Why it was rejected.
    pub reason: Reason,
}

impl UnrecognizedLine {
    fn new(line: &str, reason: Reason) -> Self {
        Self {
            line: line.to_owned(),
            reason,
        }
    }

    /// Numeric-like lines are more interesting in logs than noise.
    pub fn kind(&self) -> Kind {
        if self.line.len() > NUMERIC_LIKE_MIN_LENGTH
            && self.line.chars().any(|c| c.is_ascii_digit())
        {
            Kind::NumericLike
        } else {
            Kind::Noise
        }
    }
}

/// The outcome of decoding a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// A sensor reading.
    Frame(SensorFrame),

    /// A lifecycle marker.
    Control(ControlEvent),

    /// Anything else.
    Unrecognized(UnrecognizedLine),
}

/// Decode a line, stamping frames with the current time.
pub fn decode(line: &str) -> DecodedEvent {
    decode_at(line, Utc::now())
}

/// Decode a line, stamping frames with the given time.
///
/// Total: every input yields exactly one [`DecodedEvent`].
pub fn decode_at(line: &str, captured_at: DateTime<Utc>) -> DecodedEvent {
    let line = line.trim();

    if line.contains(INIT_START_MARKER) {
        return DecodedEvent::Control(ControlEvent::InitStarted);
    }

    if line.contains(INIT_COMPLETE_MARKER) {
        return DecodedEvent::Control(ControlEvent::InitComplete);
    }

    let Some(fields) = line
        .strip_prefix(DATA_CODEWORD)
        .and_then(|rest| rest.strip_prefix(','))
    else {
        return DecodedEvent::Unrecognized(UnrecognizedLine::new(line, Reason::NotData));
    };

    match parse_fields(fields, captured_at) {
        Ok(frame) => DecodedEvent::Frame(frame),
        Err(reason) => DecodedEvent::Unrecognized(UnrecognizedLine::new(line, reason)),
    }
}

fn parse_fields(fields: &str, captured_at: DateTime<Utc>) -> Result<SensorFrame, Reason> {
    let values = fields.split(',').collect::<Vec<_>>();

    let [vert, lat, tors, in_pos, tempo_pos, conteggio] = values[..] else {
        return Err(Reason::WrongFieldCount(values.len()));
    };

    Ok(SensorFrame {
        vert: safe_float(vert),
        lat: safe_float(lat),
        tors: safe_float(tors),
        in_pos: integer(in_pos, "inPos")? != 0,
        tempo_pos: integer(tempo_pos, "tempoPos")?,
        conteggio: integer(conteggio, "conteggio")?,
        captured_at,
    })
}

/// Unparsable and non-finite values are absent, never zero.
fn safe_float(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn integer(field: &str, name: &'static str) -> Result<i64, Reason> {
    field.trim().parse().map_err(|_| Reason::BadInteger(name))
}
