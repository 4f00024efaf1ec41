//! Orders: placement, cancellation, completion.
//!
//! Each state change publishes on the order exchange. The service also
//! consumes `inventory.updated` on `inventory.updated.order` to keep a view of
//! the latest stock level per product and raise low-stock alerts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use marketflow_core::{DomainError, DomainResult, OrderId, ProductId, UserId};
use marketflow_events::{
    HandlerRegistry, InventoryUpdated, MessageBroker, OrderCancelled, OrderCompleted, OrderCreated,
    OrderLine, Publisher, RegistryError,
};

use crate::publish_or_warn;
use crate::store::{InMemoryRepository, Repository};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct OrderService<B> {
    orders: Arc<dyn Repository<OrderId, Order>>,
    stock: Arc<dyn Repository<ProductId, InventoryUpdated>>,
    publisher: Publisher<B>,
}

impl<B> OrderService<B>
where
    B: MessageBroker,
{
    pub fn new(publisher: Publisher<B>) -> Self {
        Self::with_store(publisher, Arc::new(InMemoryRepository::new()))
    }

    pub fn with_store(publisher: Publisher<B>, orders: Arc<dyn Repository<OrderId, Order>>) -> Self {
        Self {
            orders,
            stock: Arc::new(InMemoryRepository::new()),
            publisher,
        }
    }

    /// Record a pending order and publish `order.created`.
    ///
    /// `total_amount` is the sum of `price * quantity` over the items.
    #[instrument(skip(self, items), fields(user_id = %user_id, lines = items.len()), err)]
    pub fn place_order(&self, user_id: UserId, items: Vec<OrderItem>) -> DomainResult<Order> {
        if items.is_empty() {
            return Err(DomainError::validation("an order needs at least one item"));
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(DomainError::validation(format!(
                    "quantity for {} must be at least 1",
                    item.product_id
                )));
            }
            if !(item.price.is_finite() && item.price > 0.0) {
                return Err(DomainError::validation(format!(
                    "price for {} must be positive",
                    item.product_id
                )));
            }
        }

        let total_amount = items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum();
        let now = Utc::now();
        let order = Order {
            id: OrderId::generate(),
            user_id,
            status: OrderStatus::Pending,
            items,
            total_amount,
            created_at: now,
            updated_at: now,
        };
        self.orders.upsert(order.id.clone(), order.clone());
        info!(order_id = %order.id, total_amount, "order placed");

        publish_or_warn(
            &self.publisher,
            &OrderCreated {
                order_id: order.id.clone(),
                user_id: order.user_id.clone(),
                items: order
                    .items
                    .iter()
                    .map(|item| OrderLine {
                        product_id: item.product_id.clone(),
                        quantity: item.quantity,
                    })
                    .collect(),
                total_amount: order.total_amount,
            },
        );

        Ok(order)
    }

    pub fn get_order(&self, id: &OrderId) -> DomainResult<Order> {
        self.orders
            .get(id)
            .ok_or_else(|| DomainError::not_found(format!("order {id}")))
    }

    /// A user's orders, newest first.
    pub fn user_orders(&self, user_id: &UserId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .list()
            .into_iter()
            .filter(|o| &o.user_id == user_id)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    /// Cancel an order and publish `order.cancelled`.
    ///
    /// Cancelling twice, or cancelling a completed order, is a conflict.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub fn cancel_order(&self, id: &OrderId) -> DomainResult<Order> {
        let order = self.transition(id, OrderStatus::Cancelled)?;
        publish_or_warn(
            &self.publisher,
            &OrderCancelled {
                order_id: order.id.clone(),
                user_id: order.user_id.clone(),
            },
        );
        Ok(order)
    }

    /// Mark an order delivered and publish `order.completed`.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub fn complete_order(&self, id: &OrderId) -> DomainResult<Order> {
        let order = self.transition(id, OrderStatus::Completed)?;
        publish_or_warn(
            &self.publisher,
            &OrderCompleted {
                order_id: order.id.clone(),
                user_id: order.user_id.clone(),
            },
        );
        Ok(order)
    }

    fn transition(&self, id: &OrderId, to: OrderStatus) -> DomainResult<Order> {
        let mut rejected = None;
        let order = self
            .orders
            .update(id, &mut |order| {
                if order.status == OrderStatus::Pending {
                    order.status = to;
                    order.updated_at = Utc::now();
                } else {
                    rejected = Some(order.status);
                }
            })
            .ok_or_else(|| DomainError::not_found(format!("order {id}")))?;

        match rejected {
            Some(status) => Err(DomainError::conflict(format!(
                "order {id} is already {}",
                status.as_str()
            ))),
            None => {
                info!(status = to.as_str(), "order status changed");
                Ok(order)
            }
        }
    }

    /// Apply an `inventory.updated` event to the stock view.
    pub fn observe_stock(&self, update: &InventoryUpdated) {
        info!(
            product_id = %update.product_id,
            remaining = update.quantity_remaining,
            low_stock = update.is_low_stock,
            "inventory updated"
        );
        if update.is_low_stock {
            warn!(
                product_id = %update.product_id,
                remaining = update.quantity_remaining,
                "low stock alert"
            );
        }
        self.stock.upsert(update.product_id.clone(), update.clone());
    }

    /// Products whose latest reported level was low, ordered by id.
    pub fn low_stock_products(&self) -> Vec<InventoryUpdated> {
        let mut low: Vec<InventoryUpdated> = self
            .stock
            .list()
            .into_iter()
            .filter(|u| u.is_low_stock)
            .collect();
        low.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        low
    }
}

impl<B> OrderService<B>
where
    B: MessageBroker + 'static,
{
    pub fn handlers(self: &Arc<Self>) -> Result<HandlerRegistry, RegistryError> {
        let orders = Arc::clone(self);
        HandlerRegistry::builder()
            .on::<InventoryUpdated, _>(move |update, _meta| {
                orders.observe_stock(update);
                Ok(())
            })
            .build()
    }
}
