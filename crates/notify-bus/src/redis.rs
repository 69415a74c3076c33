use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio_stream::StreamExt;
use tracing::debug;

use crate::{BusError, BusResult, EventBus, FrameStream, FrameTemplate};

// Allocation and publish must be one atomic step: run separately, two
// publishers interleaving between INCR and PUBLISH would put a later
// sequence on the wire first. The script splices the sequence into the
// frame, appends it to the replay set, trims, slides the window TTL,
// and publishes, all under the script's execution guarantee.
const PUBLISH_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local frame = ARGV[1] .. seq .. ARGV[2]
redis.call('ZADD', KEYS[2], seq, frame)
redis.call('ZREMRANGEBYRANK', KEYS[2], 0, -(tonumber(ARGV[3]) + 1))
redis.call('EXPIRE', KEYS[2], ARGV[4])
redis.call('PUBLISH', ARGV[5], frame)
return seq
"#;

/// Redis-backed bus: `INCR` counters for sequences, a sorted set per key
/// for the replay window, and one pub/sub channel shared by every relay
/// instance. Publish runs as a single Lua script so sequence order and
/// wire order agree across instances.
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
    channel: String,
    publish_script: Script,
    replay_capacity: usize,
    replay_ttl: Duration,
}

impl RedisBus {
    pub async fn connect(
        url: &str,
        channel: &str,
        replay_capacity: usize,
        replay_ttl: Duration,
    ) -> BusResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            channel: channel.to_string(),
            publish_script: Script::new(PUBLISH_SCRIPT),
            replay_capacity,
            replay_ttl,
        })
    }

    fn sequence_key(key: &str) -> String {
        format!("gavel:seq:{}", key)
    }

    fn replay_key(key: &str) -> String {
        format!("gavel:replay:{}", key)
    }
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, key: &str, template: FrameTemplate) -> BusResult<u64> {
        let mut conn = self.conn.clone();
        // No TTL on the sequence counter: a key's numbering must never
        // restart even after its replay window has aged out.
        let seq: u64 = self
            .publish_script
            .key(Self::sequence_key(key))
            .key(Self::replay_key(key))
            .arg(template.prefix.as_ref())
            .arg(template.suffix.as_ref())
            .arg(self.replay_capacity)
            .arg(self.replay_ttl.as_secs())
            .arg(&self.channel)
            .invoke_async(&mut conn)
            .await?;
        debug!(key, seq, channel = %self.channel, "frame published to bus");
        Ok(seq)
    }

    async fn replay_since(&self, key: &str, after: u64) -> BusResult<Vec<Bytes>> {
        let mut conn = self.conn.clone();
        let frames: Vec<Vec<u8>> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::replay_key(key))
            .arg(format!("({}", after))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(frames.into_iter().map(Bytes::from).collect())
    }

    async fn subscribe(&self) -> BusResult<FrameStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::from(msg.get_payload_bytes().to_vec()));
        Ok(Box::pin(stream))
    }

    fn replay_ttl(&self) -> Duration {
        self.replay_ttl
    }
}
