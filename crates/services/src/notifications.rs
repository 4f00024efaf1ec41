//! Notifications: email log entries triggered by other services' events.
//!
//! Sending is simulated; each handled event records one entry in the
//! notification log with status `sent`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use marketflow_core::{NotificationId, UserId};
use marketflow_events::{
    HandlerRegistry, OrderCompleted, OrderCreated, ProductOutOfStock, RegistryError,
    UserRegistered,
};

use crate::store::{InMemoryRepository, Repository};

/// Recipient of stock alerts.
pub const ADMIN_USER_ID: &str = "00000000-0000-0000-0000-000000000001";

pub fn admin_user_id() -> UserId {
    UserId::from(Uuid::from_u128(1))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Channel {
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationLog {
    pub id: NotificationId,
    pub user_id: UserId,
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
}

pub struct NotificationService {
    log: Arc<dyn Repository<NotificationId, NotificationLog>>,
    admin: UserId,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryRepository::new()))
    }

    pub fn with_store(log: Arc<dyn Repository<NotificationId, NotificationLog>>) -> Self {
        Self {
            log,
            admin: admin_user_id(),
        }
    }

    pub fn admin(&self) -> &UserId {
        &self.admin
    }

    #[instrument(skip_all, fields(user_id = %event.user_id))]
    pub fn on_user_registered(&self, event: &UserRegistered) -> NotificationLog {
        let entry = self.send(
            event.user_id.clone(),
            "Welcome to our platform!".to_string(),
            format!(
                "Welcome {}! Your account has been created with email {}",
                event.username, event.email
            ),
        );
        info!(username = %event.username, "welcome email sent");
        entry
    }

    #[instrument(skip_all, fields(order_id = %event.order_id))]
    pub fn on_order_created(&self, event: &OrderCreated) -> NotificationLog {
        let entry = self.send(
            event.user_id.clone(),
            "Order Confirmation".to_string(),
            format!("Your order #{} has been placed successfully.", event.order_id),
        );
        info!("order confirmation sent");
        entry
    }

    #[instrument(skip_all, fields(order_id = %event.order_id))]
    pub fn on_order_completed(&self, event: &OrderCompleted) -> NotificationLog {
        let entry = self.send(
            event.user_id.clone(),
            "Order Delivered".to_string(),
            format!("Your order #{} has been delivered.", event.order_id),
        );
        info!("delivery email sent");
        entry
    }

    #[instrument(skip_all, fields(product_id = %event.product_id))]
    pub fn on_product_out_of_stock(&self, event: &ProductOutOfStock) -> NotificationLog {
        let entry = self.send(
            self.admin.clone(),
            format!("Stock Alert: {}", event.product_name),
            format!(
                "Product {} (ID: {}) is out of stock.",
                event.product_name, event.product_id
            ),
        );
        info!(product_name = %event.product_name, "stock alert sent");
        entry
    }

    /// A user's notifications, oldest first.
    pub fn for_user(&self, user_id: &UserId) -> Vec<NotificationLog> {
        let mut entries: Vec<NotificationLog> = self
            .log
            .list()
            .into_iter()
            .filter(|n| &n.user_id == user_id)
            .collect();
        entries.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.log.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn send(&self, user_id: UserId, subject: String, body: String) -> NotificationLog {
        let entry = NotificationLog {
            id: NotificationId::generate(),
            user_id,
            channel: Channel::Email,
            subject,
            body,
            status: DeliveryStatus::Sent,
            sent_at: Utc::now(),
        };
        self.log.upsert(entry.id.clone(), entry.clone());
        entry
    }

    /// Handlers for the notification queues.
    pub fn handlers(self: &Arc<Self>) -> Result<HandlerRegistry, RegistryError> {
        let welcome = Arc::clone(self);
        let confirmation = Arc::clone(self);
        let delivered = Arc::clone(self);
        let alerts = Arc::clone(self);

        HandlerRegistry::builder()
            .on::<UserRegistered, _>(move |event, _meta| {
                welcome.on_user_registered(event);
                Ok(())
            })
            .on::<OrderCreated, _>(move |event, _meta| {
                confirmation.on_order_created(event);
                Ok(())
            })
            .on::<OrderCompleted, _>(move |event, _meta| {
                delivered.on_order_completed(event);
                Ok(())
            })
            .on::<ProductOutOfStock, _>(move |event, _meta| {
                alerts.on_product_out_of_stock(event);
                Ok(())
            })
            .build()
    }
}
