use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_core::Stream;
use notify_bus::EventBus;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{self as stream, StreamExt};
use tracing::{debug, warn};

use crate::bridge::{BridgeError, BusBridge};
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionStatus};
use crate::envelope::{Envelope, EventKind};
use crate::key::SubscriptionKey;
use crate::metrics;
use crate::registry::{ConnectionRegistry, RegistryError};

/// Front door for subscribers and publishers: ties the registry, the
/// bridge, and the replay window together behind one API.
#[derive(Clone)]
pub struct NotifyService {
    bus: Arc<dyn EventBus>,
    registry: ConnectionRegistry,
    bridge: Arc<BusBridge>,
    queue_capacity: usize,
}

impl NotifyService {
    pub fn new(
        bus: Arc<dyn EventBus>,
        registry: ConnectionRegistry,
        bridge: Arc<BusBridge>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            bus,
            registry,
            bridge,
            queue_capacity,
        }
    }

    /// Open a subscription on `key`. When `last_seen` is present,
    /// buffered events with a greater sequence are replayed ahead of
    /// live delivery, deduped against the live overlap by the replay
    /// watermark; without it the stream is live-only from the moment
    /// of registration.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        last_seen: Option<u64>,
    ) -> Result<Subscription, RegistryError> {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let now = Instant::now();
        // Register before fetching replay: frames published during the
        // fetch land in the live queue and fall on the right side of
        // the watermark.
        self.registry.register(ConnectionHandle {
            id,
            key: key.clone(),
            tx,
            opened_at: now,
            last_activity: Arc::new(RwLock::new(now)),
        })?;

        let replay = match last_seen {
            Some(after) => self.fetch_replay(&key, after).await,
            // A subscriber that declares nothing gets nothing old.
            None => Vec::new(),
        };
        if !replay.is_empty() {
            metrics::EVENTS_REPLAYED
                .with_label_values(&[&key.to_string()])
                .inc_by(replay.len() as u64);
        }
        let resume_from = replay.iter().map(|e| e.seq).max().or(last_seen).unwrap_or(0);
        debug!(
            connection = %id,
            key = %key,
            last_seen = ?last_seen,
            replayed = replay.len(),
            "subscription opened"
        );

        Ok(Subscription {
            id,
            key,
            replay,
            live: rx,
            resume_from,
            guard: StreamGuard {
                id,
                registry: self.registry.clone(),
            },
        })
    }

    /// Decode the retained frames past `after`, dropping any that have
    /// outlived the window age. The backing store can hold older frames
    /// than the window allows (the Redis sorted set expires whole keys,
    /// not members), so the age bound is enforced here.
    async fn fetch_replay(&self, key: &SubscriptionKey, after: u64) -> Vec<Arc<Envelope>> {
        let frames = match self.bus.replay_since(&key.to_string(), after).await {
            Ok(frames) => frames,
            Err(err) => {
                // Replay is best effort on a degraded bus; the client
                // still gets live delivery.
                warn!(key = %key, error = %err, "replay fetch failed, continuing live-only");
                return Vec::new();
            }
        };
        let ttl = self.bus.replay_ttl();
        let now = Utc::now();
        let mut envelopes = Vec::with_capacity(frames.len());
        for frame in frames {
            match Envelope::decode(&frame) {
                Ok(envelope) => {
                    let age = now
                        .signed_duration_since(envelope.published_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if age > ttl {
                        continue;
                    }
                    envelopes.push(Arc::new(envelope));
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "malformed replay frame skipped");
                    metrics::BUS_DECODE_FAILURES.inc();
                }
            }
        }
        envelopes
    }

    pub async fn publish(
        &self,
        key: &SubscriptionKey,
        event_type: EventKind,
        payload: serde_json::Value,
    ) -> Result<u64, BridgeError> {
        self.bridge.publish(key, event_type, payload).await
    }

    /// Gracefully close one connection. Returns false when the id is
    /// not (or no longer) registered.
    pub fn close(&self, id: ConnectionId) -> bool {
        self.registry.unregister(id, ConnectionStatus::Completed)
    }

    pub fn connection_count(&self, key: &SubscriptionKey) -> usize {
        self.registry.connection_count(&key.to_string())
    }

    pub fn total_connections(&self) -> usize {
        self.registry.total_connections()
    }
}

/// One open client subscription. Dropping it, or the stream built from
/// it, releases the registry slot with status `completed`.
pub struct Subscription {
    id: ConnectionId,
    key: SubscriptionKey,
    replay: Vec<Arc<Envelope>>,
    live: mpsc::Receiver<Arc<Envelope>>,
    resume_from: u64,
    guard: StreamGuard,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Replayed envelopes first, then live ones past the replay
    /// watermark, in sequence order throughout.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Envelope>> {
        let Subscription {
            replay,
            live,
            resume_from,
            guard,
            ..
        } = self;
        let live = ReceiverStream::new(live).filter(move |envelope| envelope.seq > resume_from);
        stream::iter(replay).chain(live).map(move |envelope| {
            // The guard rides inside the stream so any way the client
            // disconnects tears the registration down.
            let _ = &guard;
            envelope
        })
    }
}

/// Unregisters the connection when the subscription stream goes away,
/// whichever way the client disconnects.
struct StreamGuard {
    id: ConnectionId,
    registry: ConnectionRegistry,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id, ConnectionStatus::Completed);
    }
}
