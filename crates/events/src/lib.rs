//! Event-distribution backbone: envelopes, topology, publishing, dedup and consumers.
//! Also hosts the expiring key/value cache seam the services share.
//!
//! Transport-agnostic mechanics shared by every service:
//!
//! ```text
//! Publisher → exchange (routing key) → bound queue → queue worker → dedup filter → handler
//! ```
//!
//! Broker-backed implementations (AMQP, Redis) live in `marketflow-infra`.

pub mod bus;
pub mod cache;
pub mod consumer;
pub mod dedup;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod publisher;
pub mod topology;

pub use bus::{BrokerError, Delivery, MessageBroker, Subscription};
pub use cache::{CacheError, InMemoryCache, KeyValueCache};
pub use consumer::{
    Consumer, ConsumerError, ConsumerHandle, DispatchOutcome, Dispatcher, QueueState, WorkerStats,
};
pub use dedup::{
    DEFAULT_DEDUP_TTL, DedupFilter, DedupStore, DedupStoreError, InMemoryDedupStore, dedup_key,
};
pub use envelope::{Envelope, EnvelopeError};
pub use event::{
    DecodeError, DomainEvent, EventPayload, InventoryUpdated, OrderCancelled, OrderCompleted,
    OrderCreated, OrderLine, ProductCreated, ProductOutOfStock, UserDeleted, UserRegistered,
    UserUpdated, names,
};
pub use handler::{EventMeta, Handler, HandlerRegistry, HandlerRegistryBuilder, RegistryError};
pub use in_memory_bus::InMemoryBroker;
pub use publisher::{PublishError, Publisher};
pub use topology::{
    ExchangeKind, ExchangeSpec, QueueBinding, Topology, TopologyBuilder, TopologyError, exchanges,
    queues,
};
