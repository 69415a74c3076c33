use bytes::Bytes;
use chrono::{DateTime, Utc};
use notify_bus::FrameTemplate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::SubscriptionKey;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Closed set of notification types the platform emits. An unrecognized
/// type on the wire is a decode failure, not a passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AuctionWon,
    AuctionClosed,
    PaymentReceived,
    PaymentOverdue,
    ContractSigned,
    ContractCompleted,
    Notice,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuctionWon => "AUCTION_WON",
            EventKind::AuctionClosed => "AUCTION_CLOSED",
            EventKind::PaymentReceived => "PAYMENT_RECEIVED",
            EventKind::PaymentOverdue => "PAYMENT_OVERDUE",
            EventKind::ContractSigned => "CONTRACT_SIGNED",
            EventKind::ContractCompleted => "CONTRACT_COMPLETED",
            EventKind::Notice => "NOTICE",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification event as it travels the bus and the client stream.
/// Immutable once published; every local delivery shares one instance
/// behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub key: SubscriptionKey,
    pub seq: u64,
    pub event_type: EventKind,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        key: SubscriptionKey,
        seq: u64,
        event_type: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key,
            seq,
            event_type,
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let raw = serde_json::to_vec(self).map_err(CodecError::Encode)?;
        Ok(Bytes::from(raw))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(frame).map_err(CodecError::Decode)
    }

    /// Split encoding for publish: everything before the sequence digits
    /// and everything after. The bus renders the final frame once it has
    /// allocated the number; `self.seq` is ignored. Field order matches
    /// the struct, so a rendered frame is byte for byte what `encode`
    /// would produce for that sequence.
    pub fn encode_template(&self) -> Result<FrameTemplate, CodecError> {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(b"{\"key\":");
        serde_json::to_writer(&mut prefix, &self.key).map_err(CodecError::Encode)?;
        prefix.extend_from_slice(b",\"seq\":");

        let mut suffix = Vec::new();
        suffix.extend_from_slice(b",\"eventType\":");
        serde_json::to_writer(&mut suffix, &self.event_type).map_err(CodecError::Encode)?;
        suffix.extend_from_slice(b",\"payload\":");
        serde_json::to_writer(&mut suffix, &self.payload).map_err(CodecError::Encode)?;
        suffix.extend_from_slice(b",\"publishedAt\":");
        serde_json::to_writer(&mut suffix, &self.published_at).map_err(CodecError::Encode)?;
        suffix.push(b'}');

        Ok(FrameTemplate {
            prefix: Bytes::from(prefix),
            suffix: Bytes::from(suffix),
        })
    }
}
