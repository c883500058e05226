use std::{fmt::Display, net::SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one websocket subscriber for as long as it is connected.
///
/// Several subscribers may share an address (e.g. browser tabs),
/// so the address alone is not enough.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first group is plenty to tell subscribers apart in logs.
        let id = self.0.to_string();
        write!(f, "{}", &id[..8])
    }
}

/// A connected subscriber.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Subscriber {
    /// Its identity.
    pub id: SubscriberId,

    /// Where it connected from.
    pub addr: SocketAddr,
}

impl Display for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
