//! In-memory topic broker for tests/dev.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, mpsc};

use crate::bus::{BrokerError, Delivery, MessageBroker, Subscription};
use crate::topology::{ExchangeSpec, QueueBinding};

/// In-memory AMQP-style broker.
///
/// - No IO / no async
/// - Topic routing (`*` = one word, `#` = zero or more words)
/// - Queues buffer messages until a consumer attaches; several consumers on
///   one queue are served round-robin
/// - Unroutable messages are dropped
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    closed: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: BTreeMap<String, QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    bindings: Vec<(String, String)>,
    backlog: VecDeque<Delivery>,
    consumers: Vec<mpsc::Sender<Delivery>>,
    next: usize,
}

impl QueueState {
    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
    }

    fn deliver(&mut self, delivery: Delivery) {
        let mut delivery = delivery;
        while !self.consumers.is_empty() {
            let idx = self.next % self.consumers.len();
            match self.consumers[idx].send(delivery) {
                Ok(()) => {
                    self.next = idx + 1;
                    return;
                }
                Err(mpsc::SendError(returned)) => {
                    // Consumer went away; try the next one.
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Connection("broker state poisoned".into()))?;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(state)
    }

    /// Names of every declared queue (sorted).
    pub fn queue_names(&self) -> Vec<String> {
        match self.state.lock() {
            Ok(state) => state.queues.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn backlog_len(&self, queue: &str) -> usize {
        match self.state.lock() {
            Ok(state) => state.queues.get(queue).map_or(0, |q| q.backlog.len()),
            Err(_) => 0,
        }
    }
}

impl MessageBroker for InMemoryBroker {
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(BrokerError::Topology(format!(
                "exchange {} already declared as {} (durable={})",
                existing.name,
                existing.kind.as_str(),
                existing.durable
            ))),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::Topology(format!(
                "no exchange {}",
                binding.exchange
            )));
        }
        let queue = state
            .queues
            .get_mut(&binding.queue)
            .ok_or_else(|| BrokerError::Topology(format!("no queue {}", binding.queue)))?;

        let key = (binding.exchange.clone(), binding.routing_key.clone());
        if !queue.bindings.contains(&key) {
            queue.bindings.push(key);
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Publish(format!("no exchange {exchange}")));
        }

        for queue in state.queues.values_mut() {
            if queue.routes(exchange, routing_key) {
                queue.deliver(Delivery::new(exchange, routing_key, body.to_vec()));
            }
        }
        Ok(())
    }

    fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let mut state = self.state()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Consume(format!("no queue {queue}")))?;

        let (tx, rx) = mpsc::channel();
        // Backlog goes to the first consumer that attaches.
        while let Some(d) = q.backlog.pop_front() {
            let _ = tx.send(d);
        }
        q.consumers.push(tx);

        Ok(Subscription::new(rx))
    }

    fn close(&self) -> Result<(), BrokerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Connection("broker state poisoned".into()))?;
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            matches_words(&pattern[1..], key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some(_), None) | (None, Some(_)) => false,
        (Some(&"*"), Some(_)) => matches_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) => p == k && matches_words(&pattern[1..], &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broker_with(bindings: &[(&str, &str)]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(&ExchangeSpec::topic("order.exchange")).unwrap();
        for (queue, key) in bindings {
            broker.declare_queue(queue).unwrap();
            broker
                .bind_queue(&QueueBinding {
                    exchange: "order.exchange".into(),
                    queue: queue.to_string(),
                    routing_key: key.to_string(),
                })
                .unwrap();
        }
        broker
    }

    fn next(sub: &Subscription) -> Delivery {
        sub.recv_timeout(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn topic_matching_rules() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.completed"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.v2"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[test]
    fn fans_out_to_every_bound_queue() {
        let broker = broker_with(&[
            ("order.created.notify", "order.created"),
            ("order.created.product", "order.created"),
            ("order.completed.notify", "order.completed"),
        ]);
        let notify = broker.consume("order.created.notify").unwrap();
        let product = broker.consume("order.created.product").unwrap();
        let completed = broker.consume("order.completed.notify").unwrap();

        broker.publish("order.exchange", "order.created", b"m1").unwrap();

        assert_eq!(next(&notify).body, b"m1");
        assert_eq!(next(&product).body, b"m1");
        assert!(completed.try_recv().is_err());
    }

    #[test]
    fn buffers_until_a_consumer_attaches() {
        let broker = broker_with(&[("order.created.product", "order.created")]);

        broker.publish("order.exchange", "order.created", b"m1").unwrap();
        broker.publish("order.exchange", "order.created", b"m2").unwrap();
        assert_eq!(broker.backlog_len("order.created.product"), 2);

        let sub = broker.consume("order.created.product").unwrap();
        assert_eq!(next(&sub).body, b"m1");
        assert_eq!(next(&sub).body, b"m2");
        assert_eq!(broker.backlog_len("order.created.product"), 0);
    }

    #[test]
    fn publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("user.exchange", "user.registered", b"{}").unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
    }

    #[test]
    fn bind_requires_declared_exchange_and_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q").unwrap();
        let err = broker
            .bind_queue(&QueueBinding {
                exchange: "missing.exchange".into(),
                queue: "q".into(),
                routing_key: "k".into(),
            })
            .unwrap_err();
        assert!(matches!(err, BrokerError::Topology(_)));
    }

    #[test]
    fn close_disconnects_subscriptions() {
        let broker = broker_with(&[("order.created.product", "order.created")]);
        let sub = broker.consume("order.created.product").unwrap();

        broker.close().unwrap();

        assert!(sub.recv().is_err());
        assert_eq!(
            broker.publish("order.exchange", "order.created", b"m").unwrap_err(),
            BrokerError::Closed
        );
    }

    #[test]
    fn consumers_on_one_queue_are_served_round_robin() {
        let broker = broker_with(&[("order.created.product", "order.created")]);
        let a = broker.consume("order.created.product").unwrap();
        let b = broker.consume("order.created.product").unwrap();

        broker.publish("order.exchange", "order.created", b"1").unwrap();
        broker.publish("order.exchange", "order.created", b"2").unwrap();

        assert_eq!(next(&a).body, b"1");
        assert_eq!(next(&b).body, b"2");
    }
}
