pub mod bridge;
pub mod connection;
pub mod envelope;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod service;

pub use bridge::{BridgeError, BusBridge};
pub use connection::{ConnectionId, ConnectionStatus};
pub use envelope::{CodecError, Envelope, EventKind};
pub use key::{Domain, KeyError, SubscriptionKey};
pub use registry::{ConnectionRegistry, RegistryError};
pub use service::{NotifyService, Subscription};
