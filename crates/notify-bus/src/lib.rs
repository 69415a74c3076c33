use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use thiserror::Error;

mod local;
mod redis;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

/// Raw frames observed on the shared event channel, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// An encoded frame split at its sequence slot. The bus fills the slot
/// during `publish`, inside the same step that allocates the sequence,
/// so the wire frame always carries the number it was assigned.
#[derive(Debug, Clone)]
pub struct FrameTemplate {
    pub prefix: Bytes,
    pub suffix: Bytes,
}

impl FrameTemplate {
    pub fn render(&self, seq: u64) -> Bytes {
        let digits = seq.to_string();
        let mut frame =
            Vec::with_capacity(self.prefix.len() + digits.len() + self.suffix.len());
        frame.extend_from_slice(&self.prefix);
        frame.extend_from_slice(digits.as_bytes());
        frame.extend_from_slice(&self.suffix);
        Bytes::from(frame)
    }
}

/// Cluster-shared substrate behind event delivery: per-key sequence
/// counters, per-key replay windows, and one broadcast channel every
/// relay instance subscribes to. Implementations keep all three in the
/// same place so a reconnect landing on a different instance still
/// observes the sequence numbers and replay window it left behind.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Allocate the next sequence for `key`, render the frame from
    /// `template`, append it to the replay window, and broadcast it,
    /// as one atomic step per key: frames reach the channel in
    /// sequence order, and numbers strictly increase and are never
    /// reused.
    async fn publish(&self, key: &str, template: FrameTemplate) -> BusResult<u64>;

    /// Buffered frames for `key` with sequence greater than `after`,
    /// in ascending sequence order.
    async fn replay_since(&self, key: &str, after: u64) -> BusResult<Vec<Bytes>>;

    /// Open a subscription to the shared channel. The stream yields every
    /// frame broadcast after the call returns and ends when the transport
    /// drops the subscription.
    async fn subscribe(&self) -> BusResult<FrameStream>;

    /// Age bound on replayable frames. The store prunes by it where it
    /// can; readers drop anything older regardless.
    fn replay_ttl(&self) -> Duration;
}
