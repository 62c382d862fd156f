//! TrellisMQ - MQTT broker core
//!
//! The routing and delivery engine of an MQTT broker: a concurrent
//! subscription trie with `+`, `#` and `$share` support, per-client
//! sessions that track QoS 1/2 handshakes, and a durable redelivery store so
//! unacknowledged messages survive disconnects and restarts. Transports and
//! the wire codec sit outside this crate and drive it through `Broker`.

pub mod broker;
pub mod bus;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod retain;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerEvent, DispatchError, PublishReport};
pub use bus::{LocalBus, MessageBus};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{AckType, Message, OutboundPacket, QoS, SubscriptionOptions};
pub use session::{DeliveryOutcome, SessionHandle};
pub use topic::{SharedStrategy, SubscriptionTrie};
