use std::{io, time::Duration};

use thiserror::Error;

use crate::serial::error::SerialPortError;

/// Errors thay may occur in this library.
///
/// None of them stop the acquisition loop,
/// they end a single attempt at talking to the device.
#[derive(Debug, Error)]
pub enum Error {
    /// The device never reported that initialization completed.
    #[error("Device did not complete initialization within {0:?}")]
    InitTimeout(Duration),

    /// The serial link failed.
    #[error("Serial link failed: {0}")]
    Serial(#[from] SerialPortError),

    /// A recovery action did not work out.
    #[error("Recovery action failed: {0}")]
    Recovery(String),

    /// The web server could not start or crashed.
    #[error("Web server problem: {0}")]
    Server(String),

    /// The configuration is not usable.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A message could not be turned into JSON.
    #[error("Could not serialize: {0}")]
    Json(#[from] serde_json::Error),

    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),
}

impl Error {
    /// Get the problem string if this is a bad config error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(problem) = self {
            Ok(problem)
        } else {
            Err(self)
        }
    }
}
