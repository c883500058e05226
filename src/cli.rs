use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{config::Config, error::Error, hub::Envelope, hub::SystemStatus, server};

/// The command line interface for the sensor bridge.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Use a simulated sensor instead of serial ports
    #[arg(long)]
    pub mock: bool,

    /// Listen on this port instead of the configured one
    #[arg(long)]
    pub port: Option<u16>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON message of a new reading, as sent to subscribers.
    SensorUpdate,

    /// Show an example JSON message of a status change, as sent to subscribers.
    SystemStatus,
}

/// Render the example asked for.
pub fn example(example: Examples) -> Result<String, Error> {
    let envelope = match example {
        Examples::Config => return Config::example().serialize_pretty(),
        Examples::SensorUpdate => Envelope::SensorUpdate(server::test_frame()),
        Examples::SystemStatus => Envelope::SystemStatus(SystemStatus::connected(1)),
    };

    Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Handle the given command.
pub fn handle_command(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Examples(e) => println!("{}", example(e)?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from(["sensor-bridge", "bridge.ron", "--mock", "--port", "8080"])
            .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("bridge.ron")));
        assert!(cli.mock);
        assert_eq!(cli.port, Some(8080));
        assert!(cli.command.is_none());
    }

    #[test]
    fn examples_render() {
        let config = example(Examples::Config).unwrap();
        assert!(Config::deserialize(&config).is_ok());

        let update = example(Examples::SensorUpdate).unwrap();
        assert!(update.contains("sensor_update"));
    }
}
