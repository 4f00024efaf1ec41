//! Broker abstraction (mechanics only).
//!
//! The backbone talks to an AMQP-style broker: topic exchanges, durable queues
//! and routing-key bindings. `MessageBroker` is the narrow contract the
//! publisher and consumer need; the in-memory implementation lives in this
//! crate and infrastructure-backed ones (AMQP) live in `marketflow-infra`.
//!
//! ## Delivery guarantees
//!
//! Subscriptions use automatic acknowledgement: the broker considers a message
//! consumed once it has been handed to the process. Handler failures or a crash
//! mid-handling lose that message (at-most-once effective processing).

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::topology::{ExchangeSpec, QueueBinding};

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
        }
    }
}

/// A subscription to a single queue.
///
/// Deliveries arrive in the order the broker hands them out. The subscription
/// is disconnected when the broker connection/channel closes.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = broker.consume("order.created.product")?;
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(delivery) => dispatch(delivery),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Broker closed
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M = Delivery> {
    receiver: Receiver<M>,
    tag: Option<String>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            tag: None,
        }
    }

    /// Subscription identified by a broker-side consumer tag.
    pub fn with_tag(receiver: Receiver<M>, tag: impl Into<String>) -> Self {
        Self {
            receiver,
            tag: Some(tag.into()),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    /// Declaration conflicts with an existing exchange/queue, or references a missing one.
    #[error("topology error: {0}")]
    Topology(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("broker is closed")]
    Closed,
}

/// Topic-exchange message broker.
///
/// Declarations are idempotent: repeating one with identical parameters is a
/// no-op, conflicting parameters are a `BrokerError::Topology`.
///
/// ## Thread Safety
///
/// Implementations are shared between the publisher and every queue worker, so
/// the trait requires `Send + Sync`.
pub trait MessageBroker: Send + Sync {
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a durable queue.
    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Send a persistent message. Returns once the local send succeeded; does not
    /// wait for broker-side confirmation.
    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Start consuming `queue` with automatic acknowledgement.
    fn consume(&self, queue: &str) -> Result<Subscription, BrokerError>;

    /// Stop a subscription so the broker no longer delivers to it.
    ///
    /// Dropping the receiver is enough for brokers that notice a closed
    /// channel; brokers holding a server-side consumer must cancel it.
    fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        drop(subscription);
        Ok(())
    }

    /// Close the connection; every open subscription disconnects.
    fn close(&self) -> Result<(), BrokerError>;
}

impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        (**self).declare_exchange(exchange)
    }

    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).declare_queue(queue)
    }

    fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        (**self).bind_queue(binding)
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        (**self).publish(exchange, routing_key, body)
    }

    fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        (**self).consume(queue)
    }

    fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        (**self).cancel(subscription)
    }

    fn close(&self) -> Result<(), BrokerError> {
        (**self).close()
    }
}
