use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use sensor_bridge::{
    cli,
    config::Config,
    hub::{self, Hub},
    logging,
    mock::MockBackend,
    recovery::{ModprobeReset, NoRecovery, Recovery},
    serial::{serial_port::SystemSerial, SerialBackend},
    server,
    supervisor::{ConnectionState, Supervisor},
};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info};

/// Where the simulated sensor pretends to live.
const MOCK_PORT: &str = "/dev/ttyACM0";

fn spawn_acquisition<B, R>(
    backend: B,
    recovery: R,
    hub: Arc<Hub>,
    config: &Config,
    connection: ConnectionState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    B: SerialBackend + 'static,
    R: Recovery + 'static,
{
    Supervisor::new(backend, hub, recovery, config, connection).spawn(shutdown)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command)?;

        return Ok(());
    }

    let config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };
    config.validate()?;

    logging::init(config.stdout_level()?, config.file_logging()?).await;
    match &cli.config {
        Some(config_path) => debug!(?config_path, "Config from path"),
        None => debug!("Default config"),
    }

    let shutdown = CancellationToken::new();
    let (connection, frames) = ConnectionState::new();
    let hub = Arc::new(Hub::new(frames));

    let acquisition = match (cli.mock, config.recovery.enabled) {
        (true, _) => {
            info!(port = MOCK_PORT, "Using a simulated sensor");
            spawn_acquisition(
                MockBackend::simulated(MOCK_PORT),
                NoRecovery,
                hub.clone(),
                &config,
                connection,
                shutdown.clone(),
            )
        }
        (false, true) => spawn_acquisition(
            SystemSerial::new(config.serial.probe_timeout(), config.timings.read_timeout()),
            ModprobeReset::from_config(&config.recovery),
            hub.clone(),
            &config,
            connection,
            shutdown.clone(),
        ),
        (false, false) => spawn_acquisition(
            SystemSerial::new(config.serial.probe_timeout(), config.timings.read_timeout()),
            NoRecovery,
            hub.clone(),
            &config,
            connection,
            shutdown.clone(),
        ),
    };

    let heartbeat = tokio::spawn(hub::heartbeat(
        hub.clone(),
        config.heartbeat_period(),
        shutdown.clone(),
    ));

    let port = cli.port.unwrap_or(config.server.port);
    let server = server::run_on_port(config.server.clone(), hub, port, shutdown.clone());
    tokio::pin!(server);

    #[cfg(unix)]
    let mut hangup_signal = signal(SignalKind::hangup())?;
    #[cfg(unix)]
    let hangup = hangup_signal.recv();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<Option<()>>();

    let returned_early = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            None
        }
        _ = hangup => {
            info!("Told to hang up, quitting");
            None
        }
        result = &mut server => {
            error!("Server returned");
            Some(result)
        }
    };

    shutdown.cancel();

    let server_result = match returned_early {
        Some(Ok(())) => Err(color_eyre::eyre::eyre!("Server stopped unexpectedly")),
        Some(Err(e)) => Err(e.into()),
        // Let open connections close gracefully.
        None => server.await.map_err(Into::into),
    };

    let (acquisition, heartbeat) = tokio::join!(acquisition, heartbeat);
    acquisition?;
    heartbeat?;

    logging::shutdown();

    server_result
}
