//! Exchange/queue topology.
//!
//! Each producing domain owns one topic exchange. A consuming service declares
//! the exchanges it binds to, its durable queues, and one exact routing-key
//! binding per queue. The broker is the source of truth: declarations are
//! repeated on every process start and must be idempotent.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::bus::{BrokerError, MessageBroker};
use crate::event::names;

/// Exchange names, one per producing domain.
pub mod exchanges {
    pub const USER: &str = "user.exchange";
    pub const ORDER: &str = "order.exchange";
    pub const PRODUCT: &str = "product.exchange";
}

/// Queue names, one per (consumer, event) pair.
pub mod queues {
    pub const USER_REGISTERED_NOTIFY: &str = "user.registered.notify";
    pub const ORDER_CREATED_NOTIFY: &str = "order.created.notify";
    pub const ORDER_COMPLETED_NOTIFY: &str = "order.completed.notify";
    pub const PRODUCT_OUT_OF_STOCK_NOTIFY: &str = "product.outofstock.notify";
    pub const ORDER_CREATED_PRODUCT: &str = "order.created.product";
    pub const INVENTORY_UPDATED_ORDER: &str = "inventory.updated.order";
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange (the only kind the services use).
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("queue declared twice: {0}")]
    DuplicateQueue(String),

    #[error("empty {0} name")]
    EmptyName(&'static str),

    #[error("failed to declare {what}: {source}")]
    Declare {
        what: String,
        #[source]
        source: BrokerError,
    },
}

/// Validated set of exchanges and queue bindings for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Topology of a pure producer: just its own exchange.
    pub fn producer(exchange: impl Into<String>) -> Self {
        Self {
            exchanges: vec![ExchangeSpec::topic(exchange)],
            bindings: Vec::new(),
        }
    }

    /// Notification service: welcome mails, order mails, stock alerts.
    pub fn notification_service() -> Self {
        Self {
            exchanges: vec![
                ExchangeSpec::topic(exchanges::USER),
                ExchangeSpec::topic(exchanges::ORDER),
                ExchangeSpec::topic(exchanges::PRODUCT),
            ],
            bindings: vec![
                binding(exchanges::USER, queues::USER_REGISTERED_NOTIFY, names::USER_REGISTERED),
                binding(exchanges::ORDER, queues::ORDER_CREATED_NOTIFY, names::ORDER_CREATED),
                binding(exchanges::ORDER, queues::ORDER_COMPLETED_NOTIFY, names::ORDER_COMPLETED),
                binding(
                    exchanges::PRODUCT,
                    queues::PRODUCT_OUT_OF_STOCK_NOTIFY,
                    names::PRODUCT_OUT_OF_STOCK,
                ),
            ],
        }
    }

    /// Catalog service: decrements stock for every placed order.
    pub fn catalog_service() -> Self {
        Self {
            exchanges: vec![ExchangeSpec::topic(exchanges::ORDER)],
            bindings: vec![binding(
                exchanges::ORDER,
                queues::ORDER_CREATED_PRODUCT,
                names::ORDER_CREATED,
            )],
        }
    }

    /// Order service: watches inventory levels.
    pub fn order_service() -> Self {
        Self {
            exchanges: vec![ExchangeSpec::topic(exchanges::PRODUCT)],
            bindings: vec![binding(
                exchanges::PRODUCT,
                queues::INVENTORY_UPDATED_ORDER,
                names::INVENTORY_UPDATED,
            )],
        }
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.queue.as_str())
    }

    /// Declare every exchange, queue and binding, in that order.
    ///
    /// Stops at the first failure; callers treat that as fatal at startup.
    pub fn declare<B>(&self, broker: &B) -> Result<(), TopologyError>
    where
        B: MessageBroker + ?Sized,
    {
        for exchange in &self.exchanges {
            broker
                .declare_exchange(exchange)
                .map_err(|source| TopologyError::Declare {
                    what: format!("exchange {}", exchange.name),
                    source,
                })?;
            debug!(exchange = %exchange.name, kind = exchange.kind.as_str(), "exchange declared");
        }

        for b in &self.bindings {
            broker
                .declare_queue(&b.queue)
                .map_err(|source| TopologyError::Declare {
                    what: format!("queue {}", b.queue),
                    source,
                })?;
            broker.bind_queue(b).map_err(|source| TopologyError::Declare {
                what: format!("binding {} -> {} ({})", b.exchange, b.queue, b.routing_key),
                source,
            })?;
            debug!(exchange = %b.exchange, queue = %b.queue, routing_key = %b.routing_key, "queue bound");
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.bindings.len(),
            "topology declared"
        );
        Ok(())
    }
}

fn binding(exchange: &str, queue: &str, routing_key: &str) -> QueueBinding {
    QueueBinding {
        exchange: exchange.to_string(),
        queue: queue.to_string(),
        routing_key: routing_key.to_string(),
    }
}

/// Builder for consumer-defined topologies.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    exchanges: Vec<ExchangeSpec>,
    bindings: Vec<QueueBinding>,
}

impl TopologyBuilder {
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        if !self.exchanges.iter().any(|e| e.name == spec.name) {
            self.exchanges.push(spec);
        }
        self
    }

    /// Bind `queue` to `exchange` with an exact routing key.
    ///
    /// The exchange is added as a durable topic exchange if not declared yet.
    pub fn bind(
        self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        let exchange = exchange.into();
        let mut this = self.exchange(ExchangeSpec::topic(exchange.clone()));
        this.bindings.push(QueueBinding {
            exchange,
            queue: queue.into(),
            routing_key: routing_key.into(),
        });
        this
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        if self.exchanges.iter().any(|e| e.name.trim().is_empty()) {
            return Err(TopologyError::EmptyName("exchange"));
        }

        let mut seen = HashSet::new();
        for b in &self.bindings {
            if b.queue.trim().is_empty() {
                return Err(TopologyError::EmptyName("queue"));
            }
            if b.routing_key.trim().is_empty() {
                return Err(TopologyError::EmptyName("routing key"));
            }
            if !seen.insert(b.queue.as_str()) {
                return Err(TopologyError::DuplicateQueue(b.queue.clone()));
            }
        }

        Ok(Topology {
            exchanges: self.exchanges,
            bindings: self.bindings,
        })
    }
}
