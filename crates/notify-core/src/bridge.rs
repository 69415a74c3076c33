use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use notify_bus::{BusError, EventBus, FrameStream};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::envelope::{CodecError, Envelope, EventKind};
use crate::key::SubscriptionKey;
use crate::metrics;
use crate::registry::ConnectionRegistry;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge receive loop already started")]
    AlreadyStarted,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Couples the shared bus to the local registry. Owns the publish path
/// (one atomic allocate/append/broadcast step on the bus) and the
/// single receive loop this process runs; local publishes reach local
/// subscribers by looping back through that same subscription.
pub struct BusBridge {
    bus: Arc<dyn EventBus>,
    registry: ConnectionRegistry,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusBridge {
    pub fn new(bus: Arc<dyn EventBus>, registry: ConnectionRegistry) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            registry,
            started: AtomicBool::new(false),
            shutdown,
            loop_handle: Mutex::new(None),
        }
    }

    /// Publish one event. The envelope is encoded around a sequence slot
    /// and handed to the bus, which allocates the number, appends the
    /// frame to the replay window, and broadcasts it as one atomic step.
    /// Failures surface to the caller; nothing is queued for retry.
    pub async fn publish(
        &self,
        key: &SubscriptionKey,
        event_type: EventKind,
        payload: serde_json::Value,
    ) -> Result<u64, BridgeError> {
        let envelope = Envelope::new(key.clone(), 0, event_type, payload);
        let template = envelope.encode_template()?;
        let key_str = key.to_string();
        let seq = self.bus.publish(&key_str, template).await?;
        metrics::EVENTS_PUBLISHED.with_label_values(&[&key_str]).inc();
        debug!(key = %key, seq, kind = event_type.as_str(), "event published");
        Ok(seq)
    }

    /// Subscribe to the bus and spawn the receive loop. The first
    /// subscription is established here so a dead bus fails the caller
    /// instead of the spawned task.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }
        let frames = match self.bus.subscribe().await {
            Ok(frames) => frames,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        let bus = self.bus.clone();
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            receive_loop(bus, registry, frames, &mut shutdown).await;
        });
        *self.loop_handle.lock() = Some(handle);
        info!("bus bridge started");
        Ok(())
    }

    /// Signal the receive loop and wait for it to exit. Deliveries the
    /// registry already accepted stay in their connection queues.
    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(err) = handle.await {
            if err.is_panic() {
                error!("bus bridge receive loop panicked");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        info!("bus bridge stopped");
    }
}

async fn receive_loop(
    bus: Arc<dyn EventBus>,
    registry: ConnectionRegistry,
    mut frames: FrameStream,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            frame = frames.next() => match frame {
                Some(frame) => dispatch(&registry, frame),
                None => {
                    // Subscription dropped. Registered connections keep
                    // their entries; frames missed during the gap are
                    // covered by replay once clients reconnect.
                    warn!(
                        delay_secs = delay.as_secs(),
                        "bus subscription lost, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match bus.subscribe().await {
                        Ok(next) => {
                            frames = next;
                            delay = INITIAL_RECONNECT_DELAY;
                            info!("bus subscription re-established");
                        }
                        Err(err) => {
                            error!(error = %err, "bus resubscribe failed");
                            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                        }
                    }
                }
            }
        }
    }
}

fn dispatch(registry: &ConnectionRegistry, frame: Bytes) {
    match Envelope::decode(&frame) {
        Ok(envelope) => {
            let key = envelope.key.to_string();
            let envelope = Arc::new(envelope);
            let delivered = registry.deliver(&key, envelope.clone());
            debug!(key = %key, seq = envelope.seq, delivered, "frame dispatched");
        }
        Err(err) => {
            // Malformed frames are logged and skipped; one bad producer
            // must not take the loop down.
            warn!(error = %err, "malformed bus frame skipped");
            metrics::BUS_DECODE_FAILURES.inc();
        }
    }
}
