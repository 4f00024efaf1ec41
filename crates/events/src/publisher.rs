//! Publisher: wraps a domain fact in an envelope and hands it to the broker.

use serde::Serialize;
use tracing::{info, instrument};

use crate::bus::{BrokerError, MessageBroker};
use crate::envelope::{Envelope, EnvelopeError};
use crate::event::{DomainEvent, EventPayload};
use crate::topology::{Topology, TopologyError};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("routing key must not be empty")]
    EmptyRoutingKey,

    #[error("failed to serialize {event}: {reason}")]
    Serialization { event: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes onto the exchange owned by the producing service.
///
/// Failures are returned, never retried: each call site decides whether a
/// lost event is acceptable (log and continue) or fatal to the operation.
#[derive(Debug)]
pub struct Publisher<B> {
    broker: B,
    exchange: String,
}

impl<B> Publisher<B>
where
    B: MessageBroker,
{
    /// Declare the service's exchange and return a publisher bound to it.
    pub fn connect(broker: B, exchange: impl Into<String>) -> Result<Self, TopologyError> {
        let exchange = exchange.into();
        Topology::producer(exchange.clone()).declare(&broker)?;
        Ok(Self { broker, exchange })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Envelope `data` under `routing_key` and send it.
    #[instrument(skip(self, data), fields(exchange = %self.exchange), err)]
    pub fn publish<D>(&self, routing_key: &str, data: &D) -> Result<(), PublishError>
    where
        D: Serialize + ?Sized,
    {
        let body = Envelope::new(routing_key, data)
            .and_then(|env| env.to_vec())
            .map_err(|e| match e {
                EnvelopeError::EmptyEvent => PublishError::EmptyRoutingKey,
                other => PublishError::Serialization {
                    event: routing_key.to_string(),
                    reason: other.to_string(),
                },
            })?;

        self.broker.publish(&self.exchange, routing_key, &body)?;

        info!(routing_key, bytes = body.len(), "published event");
        Ok(())
    }

    /// Publish a typed payload under its own event name.
    pub fn publish_event<P: EventPayload>(&self, payload: &P) -> Result<(), PublishError> {
        self.publish(P::EVENT, payload)
    }

    pub fn publish_domain_event(&self, event: &DomainEvent) -> Result<(), PublishError> {
        self.publish(event.event_type(), event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use marketflow_core::{ProductId, UserId};
    use serde_json::{Value as JsonValue, json};

    use crate::event::{InventoryUpdated, UserRegistered};
    use crate::in_memory_bus::InMemoryBroker;
    use crate::topology::exchanges;

    fn bound_broker(exchange: &str, queue: &str, key: &str) -> std::sync::Arc<InMemoryBroker> {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        Topology::builder()
            .bind(exchange, queue, key)
            .build()
            .unwrap()
            .declare(&broker)
            .unwrap();
        broker
    }

    #[test]
    fn publishes_enveloped_json() {
        let broker = bound_broker(exchanges::USER, "user.registered.notify", "user.registered");
        let sub = broker.consume("user.registered.notify").unwrap();
        let publisher = Publisher::connect(broker.clone(), exchanges::USER).unwrap();

        publisher
            .publish_event(&UserRegistered {
                user_id: UserId::new("u-1").unwrap(),
                username: "ada".into(),
                email: "ada@example.com".into(),
            })
            .unwrap();

        let delivery = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivery.exchange, "user.exchange");
        assert_eq!(delivery.routing_key, "user.registered");

        let env = Envelope::<JsonValue>::from_slice(&delivery.body).unwrap();
        assert_eq!(env.event(), "user.registered");
        assert_eq!(
            env.data(),
            &json!({"user_id": "u-1", "username": "ada", "email": "ada@example.com"})
        );
    }

    #[test]
    fn domain_event_uses_its_own_routing_key() {
        let broker = bound_broker(exchanges::PRODUCT, "inventory.updated.order", "inventory.updated");
        let sub = broker.consume("inventory.updated.order").unwrap();
        let publisher = Publisher::connect(broker.clone(), exchanges::PRODUCT).unwrap();

        let event = DomainEvent::from(InventoryUpdated {
            product_id: ProductId::new("P1").unwrap(),
            quantity_remaining: 3,
            is_low_stock: true,
        });
        publisher.publish_domain_event(&event).unwrap();

        let delivery = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivery.routing_key, "inventory.updated");
    }

    #[test]
    fn empty_routing_key_is_rejected() {
        let publisher = Publisher::connect(InMemoryBroker::new(), exchanges::ORDER).unwrap();
        let err = publisher.publish("", &json!({})).unwrap_err();
        assert!(matches!(err, PublishError::EmptyRoutingKey));
    }

    #[test]
    fn broker_failure_is_returned_not_retried() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let publisher = Publisher::connect(broker.clone(), exchanges::ORDER).unwrap();
        broker.close().unwrap();

        let err = publisher.publish("order.created", &json!({})).unwrap_err();
        assert!(matches!(err, PublishError::Broker(BrokerError::Closed)));
    }

    #[test]
    fn unroutable_publish_still_succeeds() {
        let publisher = Publisher::connect(InMemoryBroker::new(), exchanges::ORDER).unwrap();
        assert!(publisher.publish("order.cancelled", &json!({"order_id": "o"})).is_ok());
    }
}
