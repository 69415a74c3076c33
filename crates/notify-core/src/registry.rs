use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionStatus};
use crate::envelope::Envelope;
use crate::metrics;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already registered")]
    DuplicateConnection(ConnectionId),
}

/// Every live connection on this instance, grouped by subscription key.
/// The registry is the only owner of connection handles: registration,
/// fan-out, idle sweep, and every terminal transition go through it.
#[derive(Clone)]
pub struct ConnectionRegistry {
    /// key (rendered) -> (connection id -> handle)
    channels: Arc<DashMap<String, DashMap<ConnectionId, ConnectionHandle>>>,
    /// connection id -> key, for O(1) removal by id
    index: Arc<DashMap<ConnectionId, String>>,
    idle_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            index: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    pub(crate) fn register(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let id = handle.id;
        let key = handle.key.to_string();
        // The index entry is the claim on the id; losing this race is
        // the duplicate case.
        match self.index.entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                slot.insert(key.clone());
            }
        }
        self.channels
            .entry(key.clone())
            .or_default()
            .insert(id, handle);
        metrics::CONNECTIONS_OPEN.with_label_values(&[&key]).inc();
        metrics::CONNECTIONS_OPENED.with_label_values(&[&key]).inc();
        debug!(connection = %id, key = %key, "connection registered");
        Ok(())
    }

    /// Fan an envelope out to every connection subscribed to `key`.
    /// Never blocks: a full or closed queue errors that connection out
    /// on the spot. Returns how many connections accepted the frame.
    pub fn deliver(&self, key: &str, envelope: Arc<Envelope>) -> usize {
        let Some(channel) = self.channels.get(key) else {
            return 0;
        };
        // Snapshot senders so no map guard is held across try_send or
        // the unregister that a failed send triggers.
        let targets: Vec<_> = channel
            .iter()
            .map(|entry| (entry.id, entry.tx.clone(), entry.last_activity.clone()))
            .collect();
        drop(channel);

        let mut delivered: u64 = 0;
        for (id, tx, last_activity) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => {
                    *last_activity.write() = Instant::now();
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = %id, key, "connection queue full, closing slow consumer");
                    metrics::DELIVERIES_DROPPED.with_label_values(&[key]).inc();
                    self.unregister(id, ConnectionStatus::Errored);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection = %id, key, "connection queue closed, removing");
                    metrics::DELIVERIES_DROPPED.with_label_values(&[key]).inc();
                    self.unregister(id, ConnectionStatus::Errored);
                }
            }
        }
        if delivered > 0 {
            metrics::EVENTS_DELIVERED
                .with_label_values(&[key])
                .inc_by(delivered);
        }
        delivered as usize
    }

    /// Remove a connection, recording its terminal status. Idempotent:
    /// the sweep, a failed delivery, an explicit close, and a dropped
    /// stream may race, and only the first caller observes `true`.
    pub fn unregister(&self, id: ConnectionId, status: ConnectionStatus) -> bool {
        let Some(key) = self.index.get(&id).map(|entry| entry.clone()) else {
            return false;
        };
        let removed = match self.channels.get(&key) {
            Some(channel) => channel.remove(&id).map(|(_, handle)| handle),
            None => None,
        };
        let Some(handle) = removed else {
            return false;
        };
        self.index.remove(&id);
        self.channels.remove_if(&key, |_, channel| channel.is_empty());
        metrics::CONNECTIONS_OPEN.with_label_values(&[&key]).dec();
        metrics::CONNECTIONS_CLOSED
            .with_label_values(&[&key, status.as_str()])
            .inc();
        info!(
            connection = %id,
            key = %key,
            status = status.as_str(),
            lifetime_ms = handle.opened_at.elapsed().as_millis() as u64,
            "connection closed"
        );
        true
    }

    /// One sweep pass: remove connections idle past the timeout. Kept
    /// separate from the timer task so the policy is callable directly.
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        // Collect activity locks first; never hold map guards while
        // checking or removing.
        let mut checks = Vec::new();
        for channel in self.channels.iter() {
            for entry in channel.value().iter() {
                checks.push((entry.id, entry.last_activity.clone()));
            }
        }

        let mut swept = Vec::new();
        for (id, last_activity) in checks {
            let idle = last_activity.read().elapsed();
            if idle > self.idle_timeout && self.unregister(id, ConnectionStatus::TimedOut) {
                info!(connection = %id, idle_ms = idle.as_millis() as u64, "idle connection swept");
                swept.push(id);
            }
        }
        swept
    }

    /// Periodic idle sweep. The caller owns the handle and aborts it on
    /// shutdown.
    pub fn spawn_idle_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = registry.sweep_idle();
                if !swept.is_empty() {
                    info!(count = swept.len(), "idle sweep removed connections");
                }
            }
        })
    }

    /// Close every connection on this instance, recording `completed`.
    /// Runs at shutdown after the grace period: dropping the senders
    /// ends the client streams, which lets the server finish draining.
    /// Returns how many were closed.
    pub fn drain(&self) -> usize {
        let ids: Vec<ConnectionId> = self.index.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.unregister(*id, ConnectionStatus::Completed))
            .count()
    }

    pub fn connection_count(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|channel| channel.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.index.len()
    }
}
