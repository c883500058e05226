use std::{net::IpAddr, path::Path, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::Error;

/// Where the web server listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: IpAddr,

    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: crate::server::DEFAULT_PORT,
        }
    }
}

/// How to find and talk to the sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial speed, the firmware uses 115200.
    pub baud: u32,

    /// Device paths starting with any of these are candidates.
    /// Earlier entries are tried first.
    pub path_prefixes: Vec<String>,

    /// How long a probe may block opening a port.
    pub probe_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            path_prefixes: vec!["/dev/ttyACM".into(), "/dev/ttyUSB".into()],
            probe_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    /// See [`SerialConfig::probe_timeout_ms`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// The delays and windows of the acquisition loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    /// Wait after no port could be found.
    pub resolve_backoff_ms: u64,

    /// Wait after a session ended.
    pub failure_cooldown_ms: u64,

    /// How long the device gets to report `INIT_COMPLETE`.
    pub init_window_ms: u64,

    /// Longest wait for a single line.
    pub read_timeout_ms: u64,

    /// Settling time around each DTR edge.
    pub dtr_settle_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            resolve_backoff_ms: 5_000,
            failure_cooldown_ms: 3_000,
            init_window_ms: 120_000,
            read_timeout_ms: 1_000,
            dtr_settle_ms: 500,
        }
    }
}

impl Timings {
    /// See [`Timings::resolve_backoff_ms`].
    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    /// See [`Timings::failure_cooldown_ms`].
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }

    /// See [`Timings::init_window_ms`].
    pub fn init_window(&self) -> Duration {
        Duration::from_millis(self.init_window_ms)
    }

    /// See [`Timings::read_timeout_ms`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// See [`Timings::dtr_settle_ms`].
    pub fn dtr_settle(&self) -> Duration {
        Duration::from_millis(self.dtr_settle_ms)
    }
}

/// The USB bus reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Off by default since it needs root.
    pub enabled: bool,

    /// Reset each time this many attempts in a row have failed.
    pub after_failures: u32,

    /// The kernel module to reload.
    pub module: String,

    /// Run `modprobe` through `sudo -n`.
    pub use_sudo: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            after_failures: 6,
            module: "usbhid".into(),
            use_sudo: true,
        }
    }
}

/// Log to a daily rotated file, in addition to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileLogging {
    /// Directory of the log files.
    pub dir: PathBuf,

    /// Most verbose level written to file.
    pub level: String,
}

/// Logging setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Stdout level, unless `RUST_LOG` is set.
    pub level: String,

    /// Optional file logging.
    pub file: Option<FileLogging>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

/// The configuration used for running the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// See [`ServerConfig`].
    pub server: ServerConfig,

    /// See [`SerialConfig`].
    pub serial: SerialConfig,

    /// See [`Timings`].
    pub timings: Timings,

    /// See [`RecoveryConfig`].
    pub recovery: RecoveryConfig,

    /// Period of the subscriber heartbeat.
    pub heartbeat_ms: u64,

    /// See [`LoggingConfig`].
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            timings: Timings::default(),
            recovery: RecoveryConfig::default(),
            heartbeat_ms: 30_000,
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_level(level: &str) -> Result<Level, Error> {
    Level::from_str(level).map_err(|_| Error::BadConfig(format!("`{level}` is not a log level")))
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not valid RON: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            recovery: RecoveryConfig {
                enabled: true,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".into(),
                file: Some(FileLogging {
                    dir: PathBuf::from("/var/log/sensor-bridge"),
                    level: "info".into(),
                }),
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(p)?;

        Self::deserialize(&s)
    }

    /// See [`Config::heartbeat_ms`].
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// The stdout log level.
    pub fn stdout_level(&self) -> Result<Level, Error> {
        parse_level(&self.logging.level)
    }

    /// The file log level and directory, if file logging is on.
    pub fn file_logging(&self) -> Result<Option<(Level, PathBuf)>, Error> {
        self.logging
            .file
            .as_ref()
            .map(|file| Ok((parse_level(&file.level)?, file.dir.clone())))
            .transpose()
    }

    fn check_serial(&self) -> Result<(), Error> {
        if self.serial.baud == 0 {
            return Err(Error::BadConfig("The baud rate must be above zero.".into()));
        }

        if self.serial.path_prefixes.is_empty()
            || self.serial.path_prefixes.iter().any(|p| p.is_empty())
        {
            return Err(Error::BadConfig(format!(
                "At least one non-empty serial path prefix is needed, got {:?}.",
                self.serial.path_prefixes
            )));
        }

        Ok(())
    }

    fn check_timings(&self) -> Result<(), Error> {
        let t = &self.timings;
        let named = [
            ("resolve_backoff_ms", t.resolve_backoff_ms),
            ("failure_cooldown_ms", t.failure_cooldown_ms),
            ("init_window_ms", t.init_window_ms),
            ("read_timeout_ms", t.read_timeout_ms),
            ("heartbeat_ms", self.heartbeat_ms),
        ];

        let zeroes = named
            .iter()
            .filter(|(_, value)| *value == 0)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();

        if !zeroes.is_empty() {
            return Err(Error::BadConfig(format!(
                "These durations must be above zero: {zeroes:?}"
            )));
        }

        if t.read_timeout_ms > t.init_window_ms {
            return Err(Error::BadConfig(format!(
                "The read timeout ({} ms) must not exceed the init window ({} ms).",
                t.read_timeout_ms, t.init_window_ms
            )));
        }

        Ok(())
    }

    fn check_recovery(&self) -> Result<(), Error> {
        if self.recovery.after_failures == 0 {
            return Err(Error::BadConfig(
                "recovery.after_failures must be above zero.".into(),
            ));
        }

        if self.recovery.enabled && self.recovery.module.is_empty() {
            return Err(Error::BadConfig(
                "Recovery is enabled but no kernel module is given.".into(),
            ));
        }

        Ok(())
    }

    /// Check the configuration for values the bridge can not work with.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_serial()?;
        self.check_timings()?;
        self.check_recovery()?;
        self.stdout_level()?;
        self.file_logging()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_follow_the_firmware() {
        let c = Config::default();

        assert_eq!(c.serial.baud, 115_200);
        assert_eq!(c.timings.init_window(), Duration::from_secs(120));
        assert_eq!(c.timings.resolve_backoff(), Duration::from_secs(5));
        assert_eq!(c.timings.failure_cooldown(), Duration::from_secs(3));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn heartbeat_default_is_thirty_seconds() {
        let c = Config::deserialize("()").unwrap();
        assert_eq!(c.heartbeat_period(), Duration::from_secs(30));
    }

    #[test]
    fn serialize_round_trip() {
        let c = Config::example();
        let s = c.serialize_pretty().unwrap();

        println!("{s}");

        assert_eq!(Config::deserialize(&s).unwrap(), c);
    }

    #[test]
    fn deserialize_partial() {
        let input = r#"
(
    server: (
        port: 8080,
    ),
    serial: (
        path_prefixes: ["/dev/ttyUSB"],
    ),
    recovery: (
        enabled: true,
        after_failures: 3,
    ),
    logging: (
        file: (
            dir: "/tmp/logs",
            level: "trace",
        ),
    ),
)
"#;
        let c = Config::deserialize(input).unwrap();

        assert_eq!(c.server.port, 8080);
        assert_eq!(c.serial.baud, 115_200);
        assert_eq!(c.serial.path_prefixes, vec!["/dev/ttyUSB"]);
        assert_eq!(c.recovery.after_failures, 3);
        assert_eq!(c.recovery.module, "usbhid");
        assert_eq!(
            c.file_logging().unwrap(),
            Some((Level::TRACE, PathBuf::from("/tmp/logs")))
        );
        assert!(c.validate().is_ok());
    }

    #[test]
    fn not_ron_is_bad_config() {
        let err = Config::deserialize("{ json: true }").unwrap_err();
        assert!(err.try_into_bad_config().is_ok());
    }

    #[test]
    fn bad_config_empty_prefixes() {
        let mut c = Config::default();
        c.serial.path_prefixes.clear();

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("prefix"));
    }

    #[test]
    fn bad_config_zero_durations() {
        let mut c = Config::default();
        c.timings.failure_cooldown_ms = 0;
        c.heartbeat_ms = 0;

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        // Let's do some assertions that enforces our error messages to at least be decent.
        assert!(err.contains("failure_cooldown_ms"));
        assert!(err.contains("heartbeat_ms"));
        assert!(!err.contains("init_window_ms"));
    }

    #[test]
    fn bad_config_read_timeout_longer_than_init_window() {
        let mut c = Config::default();
        c.timings.read_timeout_ms = c.timings.init_window_ms + 1;

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("init window"));
    }

    #[test]
    fn bad_config_log_level() {
        let mut c = Config::default();
        c.logging.level = "loud".into();

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("loud"));
    }

    #[test]
    fn bad_config_recovery() {
        let mut c = Config::default();
        c.recovery.after_failures = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.recovery.enabled = true;
        c.recovery.module.clear();
        assert!(c.validate().is_err());
    }
}
