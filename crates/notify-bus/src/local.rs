use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::{BusError, BusResult, EventBus, FrameStream, FrameTemplate};

const BUS_CHANNEL_CAPACITY: usize = 1024;

pub const DEFAULT_REPLAY_CAPACITY: usize = 256;
pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(900);

/// In-memory bus for tests and single-instance deployments. Sequences,
/// replay windows, and the broadcast channel all live in this process,
/// so a reconnect is only served correctly by the same instance.
pub struct LocalBus {
    frames: broadcast::Sender<Bytes>,
    sequences: DashMap<String, u64>,
    replays: DashMap<String, VecDeque<ReplayEntry>>,
    replay_capacity: usize,
    replay_ttl: Duration,
}

struct ReplayEntry {
    seq: u64,
    stored_at: Instant,
    frame: Bytes,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_REPLAY_CAPACITY, DEFAULT_REPLAY_TTL)
    }

    pub fn with_limits(replay_capacity: usize, replay_ttl: Duration) -> Self {
        let (frames, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);
        Self {
            frames,
            sequences: DashMap::new(),
            replays: DashMap::new(),
            replay_capacity,
            replay_ttl,
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, key: &str, template: FrameTemplate) -> BusResult<u64> {
        // The entry guard is held across the whole allocate/append/send
        // step, so frames for one key hit the channel in sequence order
        // no matter how publishers interleave.
        let mut counter = self.sequences.entry(key.to_string()).or_insert(0);
        *counter += 1;
        let seq = *counter;
        let frame = template.render(seq);

        let now = Instant::now();
        {
            let mut ring = self.replays.entry(key.to_string()).or_default();
            if let Some(cutoff) = now.checked_sub(self.replay_ttl) {
                while ring.front().is_some_and(|entry| entry.stored_at < cutoff) {
                    ring.pop_front();
                }
            }
            ring.push_back(ReplayEntry {
                seq,
                stored_at: now,
                frame: frame.clone(),
            });
            while ring.len() > self.replay_capacity {
                ring.pop_front();
            }
        }

        self.frames.send(frame).map_err(|_| BusError::Closed)?;
        Ok(seq)
    }

    async fn replay_since(&self, key: &str, after: u64) -> BusResult<Vec<Bytes>> {
        let Some(ring) = self.replays.get(key) else {
            return Ok(Vec::new());
        };
        let cutoff = Instant::now().checked_sub(self.replay_ttl);
        Ok(ring
            .iter()
            .filter(|entry| entry.seq > after)
            .filter(|entry| cutoff.map_or(true, |cutoff| entry.stored_at >= cutoff))
            .map(|entry| entry.frame.clone())
            .collect())
    }

    async fn subscribe(&self) -> BusResult<FrameStream> {
        let rx = self.frames.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|frame| match frame {
            Ok(frame) => Some(frame),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "bus subscriber lagged, frames skipped");
                None
            }
        });
        Ok(Box::pin(stream))
    }

    fn replay_ttl(&self) -> Duration {
        self.replay_ttl
    }
}
