//! Service logic on the event-facing side: accounts, carts, catalog, orders, notifications.
//!
//! Every service keeps its state behind a [`store::Repository`] and talks to
//! the others only through domain events: producers hold a
//! [`Publisher`](marketflow_events::Publisher), consumers expose a
//! [`HandlerRegistry`](marketflow_events::HandlerRegistry) for the queue
//! workers.

pub mod accounts;
pub mod cart;
pub mod catalog;
pub mod notifications;
pub mod orders;
pub mod store;
pub mod worker;

mod integration_tests;

use tracing::warn;

use marketflow_events::{EventPayload, MessageBroker, Publisher};

/// Publish `payload`, logging instead of failing when the broker rejects it.
///
/// The state change that produced the event has already been stored; losing
/// the event is accepted rather than undoing it.
pub(crate) fn publish_or_warn<B, P>(publisher: &Publisher<B>, payload: &P)
where
    B: MessageBroker,
    P: EventPayload,
{
    if let Err(e) = publisher.publish_event(payload) {
        warn!(event = P::EVENT, error = %e, "event not published");
    }
}
