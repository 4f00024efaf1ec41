//! Typed event payloads.
//!
//! Every routing key maps to exactly one payload struct. The dispatcher decodes
//! `data` into the variant matching the envelope's event name, so handlers never
//! inspect untyped maps.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use marketflow_core::{OrderId, ProductId, UserId};

/// Event names (routing keys).
pub mod names {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_UPDATED: &str = "user.updated";
    pub const USER_DELETED: &str = "user.deleted";
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const PRODUCT_CREATED: &str = "product.created";
    pub const PRODUCT_OUT_OF_STOCK: &str = "product.out_of_stock";
    pub const INVENTORY_UPDATED: &str = "inventory.updated";
}

/// A payload bound to a single event name.
pub trait EventPayload:
    Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static
{
    /// Stable event name, also used as the routing key.
    const EVENT: &'static str;

    fn into_event(self) -> DomainEvent;

    fn from_event(event: &DomainEvent) -> Option<&Self>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
}

/// Profile after an update (every field, not just the changed ones).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: OrderId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub product_name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOutOfStock {
    pub product_id: ProductId,
    pub product_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUpdated {
    pub product_id: ProductId,
    pub quantity_remaining: u32,
    pub is_low_stock: bool,
}

/// Every event the services exchange.
///
/// Serializes as the bare payload (the event name lives in the envelope).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    UserRegistered(UserRegistered),
    UserUpdated(UserUpdated),
    UserDeleted(UserDeleted),
    OrderCreated(OrderCreated),
    OrderCompleted(OrderCompleted),
    OrderCancelled(OrderCancelled),
    ProductCreated(ProductCreated),
    ProductOutOfStock(ProductOutOfStock),
    InventoryUpdated(InventoryUpdated),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

fn decode_as<P: EventPayload>(data: JsonValue) -> Result<DomainEvent, DecodeError> {
    serde_json::from_value::<P>(data)
        .map(P::into_event)
        .map_err(|e| DecodeError::InvalidPayload {
            event: P::EVENT.to_string(),
            reason: e.to_string(),
        })
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::UserRegistered(_) => UserRegistered::EVENT,
            DomainEvent::UserUpdated(_) => UserUpdated::EVENT,
            DomainEvent::UserDeleted(_) => UserDeleted::EVENT,
            DomainEvent::OrderCreated(_) => OrderCreated::EVENT,
            DomainEvent::OrderCompleted(_) => OrderCompleted::EVENT,
            DomainEvent::OrderCancelled(_) => OrderCancelled::EVENT,
            DomainEvent::ProductCreated(_) => ProductCreated::EVENT,
            DomainEvent::ProductOutOfStock(_) => ProductOutOfStock::EVENT,
            DomainEvent::InventoryUpdated(_) => InventoryUpdated::EVENT,
        }
    }

    /// Decode `data` into the variant registered for `event`.
    pub fn decode(event: &str, data: JsonValue) -> Result<Self, DecodeError> {
        match event {
            names::USER_REGISTERED => decode_as::<UserRegistered>(data),
            names::USER_UPDATED => decode_as::<UserUpdated>(data),
            names::USER_DELETED => decode_as::<UserDeleted>(data),
            names::ORDER_CREATED => decode_as::<OrderCreated>(data),
            names::ORDER_COMPLETED => decode_as::<OrderCompleted>(data),
            names::ORDER_CANCELLED => decode_as::<OrderCancelled>(data),
            names::PRODUCT_CREATED => decode_as::<ProductCreated>(data),
            names::PRODUCT_OUT_OF_STOCK => decode_as::<ProductOutOfStock>(data),
            names::INVENTORY_UPDATED => decode_as::<InventoryUpdated>(data),
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }
}

macro_rules! impl_payload {
    ($t:ident, $name:path) => {
        impl EventPayload for $t {
            const EVENT: &'static str = $name;

            fn into_event(self) -> DomainEvent {
                DomainEvent::$t(self)
            }

            fn from_event(event: &DomainEvent) -> Option<&Self> {
                match event {
                    DomainEvent::$t(p) => Some(p),
                    _ => None,
                }
            }
        }

        impl From<$t> for DomainEvent {
            fn from(value: $t) -> Self {
                DomainEvent::$t(value)
            }
        }
    };
}

impl_payload!(UserRegistered, names::USER_REGISTERED);
impl_payload!(UserUpdated, names::USER_UPDATED);
impl_payload!(UserDeleted, names::USER_DELETED);
impl_payload!(OrderCreated, names::ORDER_CREATED);
impl_payload!(OrderCompleted, names::ORDER_COMPLETED);
impl_payload!(OrderCancelled, names::ORDER_CANCELLED);
impl_payload!(ProductCreated, names::PRODUCT_CREATED);
impl_payload!(ProductOutOfStock, names::PRODUCT_OUT_OF_STOCK);
impl_payload!(InventoryUpdated, names::INVENTORY_UPDATED);
