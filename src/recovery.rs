//! Heavier remedies for a device which does not come back by reconnecting alone.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{config::RecoveryConfig, error::Error};

/// A best-effort action restoring a stuck device.
///
/// Failing is fine, the caller only logs it.
#[async_trait]
pub trait Recovery: Send + Sync {
    /// Reset the bus the device hangs off.
    async fn reset_bus(&self) -> Result<(), Error>;
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

#[async_trait]
impl Recovery for NoRecovery {
    async fn reset_bus(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Unloads and reloads a kernel module, re-enumerating the devices it drives.
#[derive(Debug, Clone)]
pub struct ModprobeReset {
    module: String,
    use_sudo: bool,
    step_timeout: Duration,
    after_unload: Duration,
    after_reload: Duration,
}

impl ModprobeReset {
    /// Reset via the given module.
    pub fn new(module: &str, use_sudo: bool) -> Self {
        Self {
            module: module.to_owned(),
            use_sudo,
            step_timeout: Duration::from_secs(5),
            after_unload: Duration::from_secs(1),
            after_reload: Duration::from_secs(2),
        }
    }

    /// From configuration.
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(&config.module, config.use_sudo)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = if self.use_sudo {
            let mut sudo = Command::new("sudo");
            // Never prompt for a password, there is nobody to answer.
            sudo.arg("-n").arg("modprobe");
            sudo
        } else {
            Command::new("modprobe")
        };
        command.args(args).kill_on_drop(true);
        command
    }

    async fn run(&self, args: &[&str]) -> Result<(), Error> {
        let status = tokio::time::timeout(self.step_timeout, self.command(args).status())
            .await
            .map_err(|_| {
                Error::Recovery(format!(
                    "`modprobe {}` did not finish within {:?}",
                    args.join(" "),
                    self.step_timeout
                ))
            })??;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Recovery(format!(
                "`modprobe {}` exited with {status}",
                args.join(" ")
            )))
        }
    }
}

#[async_trait]
impl Recovery for ModprobeReset {
    async fn reset_bus(&self) -> Result<(), Error> {
        warn!(module = %self.module, "Performing full USB bus reset");

        self.run(&["-r", self.module.as_str()]).await?;
        tokio::time::sleep(self.after_unload).await;

        self.run(&[self.module.as_str()]).await?;
        tokio::time::sleep(self.after_reload).await;

        info!("USB bus reset complete");
        Ok(())
    }
}
