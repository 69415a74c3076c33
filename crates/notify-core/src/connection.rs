use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::key::SubscriptionKey;

/// Unique id of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a connection. `Open` is the only non-terminal
/// state; the registry records one terminal state exactly once, at the
/// moment it drops the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Open,
    Completed,
    TimedOut,
    Errored,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Open => "open",
            ConnectionStatus::Completed => "completed",
            ConnectionStatus::TimedOut => "timed_out",
            ConnectionStatus::Errored => "errored",
        }
    }
}

/// Registry-owned state for one live connection. The bounded sender is
/// the only handle the fan-out path touches; the receiving half lives
/// with the subscription stream.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: ConnectionId,
    pub(crate) key: SubscriptionKey,
    pub(crate) tx: mpsc::Sender<Arc<Envelope>>,
    pub(crate) opened_at: Instant,
    pub(crate) last_activity: Arc<RwLock<Instant>>,
}
