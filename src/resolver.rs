//! Finds which serial port currently hosts the sensor.

use itertools::Itertools;
use tracing::{debug, info};

use crate::serial::{PortDescriptor, SerialBackend};

/// Probes candidate ports in a stable order.
#[derive(Debug, Clone)]
pub struct PortResolver {
    /// Device naming differs between driver stacks,
    /// e.g. `/dev/ttyACM` for CDC-ACM and `/dev/ttyUSB` for USB-serial bridges.
    prefixes: Vec<String>,
    baud: u32,
}

impl PortResolver {
    /// Resolve ports whose path starts with any of the prefixes.
    /// Earlier prefixes are preferred.
    pub fn new<S: AsRef<str>>(prefixes: &[S], baud: u32) -> Self {
        Self {
            prefixes: prefixes.iter().map(|p| p.as_ref().to_owned()).collect(),
            baud,
        }
    }

    fn family(&self, path: &str) -> Option<usize> {
        self.prefixes
            .iter()
            .position(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Candidate paths in the order they will be probed.
    pub fn candidates<B: SerialBackend>(&self, backend: &B) -> Vec<String> {
        backend
            .candidates()
            .into_iter()
            .filter_map(|path| self.family(&path).map(|family| (family, path)))
            .sorted()
            .dedup()
            .map(|(_, path)| path)
            .collect()
    }

    /// The first candidate which can be opened, if any.
    ///
    /// The probe handle is closed again right away.
    /// A port may vanish before it is opened for real, callers must expect that.
    pub fn resolve<B: SerialBackend>(&self, backend: &B) -> Option<PortDescriptor> {
        let candidates = self.candidates(backend);

        if candidates.is_empty() {
            debug!(prefixes = ?self.prefixes, "No candidate ports");
            return None;
        }

        for path in candidates {
            match backend.probe(&path, self.baud) {
                Ok(()) => {
                    info!(%path, "Found sensor port");
                    return Some(PortDescriptor::new(&path, self.baud));
                }
                Err(e) => debug!(%path, %e, "Probe failed"),
            }
        }

        None
    }
}
