//! Handler registration table.
//!
//! Built once at service startup and immutable afterwards: the consumer shares
//! one `Arc<HandlerRegistry>` between every queue worker.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::{DomainEvent, EventPayload};

/// Delivery metadata handed to every handler alongside the typed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMeta<'a> {
    pub event: &'a str,
    pub timestamp: DateTime<Utc>,
    pub queue: &'a str,
}

/// Type-erased handler stored in the registry.
///
/// Handlers are plain synchronous calls. An `Err` is logged by the dispatcher;
/// the event is not retried, re-queued or dead-lettered.
pub type Handler = Arc<dyn Fn(&DomainEvent, &EventMeta<'_>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler registered twice for {0}")]
    DuplicateHandler(String),
}

/// Event name → handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut events: Vec<&str> = self.events().collect();
        events.sort_unstable();
        f.debug_struct("HandlerRegistry").field("events", &events).finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, event: &str) -> Option<&Handler> {
        self.handlers.get(event)
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<(String, Handler)>,
}

impl HandlerRegistryBuilder {
    /// Register a typed handler for `P::EVENT`.
    pub fn on<P, F>(self, handler: F) -> Self
    where
        P: EventPayload,
        F: Fn(&P, &EventMeta<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_event(P::EVENT, move |event, meta| match P::from_event(event) {
            Some(payload) => handler(payload, meta),
            None => Err(anyhow::anyhow!(
                "handler for {} received {}",
                P::EVENT,
                event.event_type()
            )),
        })
    }

    /// Register a handler that receives the decoded union directly.
    pub fn on_event<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&DomainEvent, &EventMeta<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((event.into(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (event, handler) in self.handlers {
            if handlers.contains_key(&event) {
                return Err(RegistryError::DuplicateHandler(event));
            }
            handlers.insert(event, handler);
        }
        Ok(HandlerRegistry { handlers })
    }
}
