#![deny(missing_docs)]

//! This crate bridges a serial sensor to websocket subscribers.
//!
//! The acquisition loop looks for the sensor on `/dev/ttyACM*` and `/dev/ttyUSB*`,
//! resets it, waits for it to finish calibrating, then decodes the lines it prints.
//! Readings are fanned out to every websocket subscriber.
//!
//! Whenever the link fails the loop starts over from scratch,
//! optionally resetting the USB bus when the device keeps failing.
//!
//! A simulated sensor is available, which allows running the whole bridge
//! without hardware.

/// Code relating to setting up a server.
pub mod server;

/// Possible errors in this library.
pub mod error;

/// Serial port setup and line framing.
pub mod serial;

/// Decoding sensor output.
pub mod frame;

/// Finding the sensor.
pub mod resolver;

/// Talking to the sensor over one connection.
pub mod session;

/// The acquisition loop.
pub mod supervisor;

/// Remedies for a stuck device.
pub mod recovery;

/// Fan-out to subscribers.
pub mod hub;

/// Identities of subscribers.
pub mod subscriber;

/// Websocket subscribers.
pub mod websocket;

/// Configuration.
pub mod config;

/// Logging setup.
pub mod logging;

/// Command line interface.
pub mod cli;

/// Mock serial ports.
pub mod mock;
