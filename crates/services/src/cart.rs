//! Shopping carts.
//!
//! A cart is a JSON list of lines stored under `cart:<user_id>` in the shared
//! cache and kept for [`CART_TTL`] after its last change. Carts never touch
//! the broker. An emptied cart is deleted rather than stored empty.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use marketflow_core::{DomainError, ProductId, UserId};
use marketflow_events::{CacheError, KeyValueCache};

/// Idle carts are evicted after a week.
pub const CART_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum CartError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("stored cart for {user_id} is unreadable: {reason}")]
    Corrupt { user_id: UserId, reason: String },
}

pub type CartResult<T> = Result<T, CartError>;

pub fn cart_key(user_id: &UserId) -> String {
    format!("cart:{user_id}")
}

pub struct CartService {
    cache: Arc<dyn KeyValueCache>,
}

impl CartService {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }

    /// The user's cart; empty when none is stored.
    pub fn get_cart(&self, user_id: &UserId) -> CartResult<Vec<CartItem>> {
        let Some(raw) = self.cache.get(&cart_key(user_id))? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|e| CartError::Corrupt {
            user_id: user_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Add a line. A product already in the cart has its quantity increased
    /// and its price replaced by the new one.
    #[instrument(skip(self, item), fields(user_id = %user_id, product_id = %item.product_id), err)]
    pub fn add_to_cart(&self, user_id: &UserId, item: CartItem) -> CartResult<Vec<CartItem>> {
        if item.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }
        if !(item.price.is_finite() && item.price >= 0.0) {
            return Err(DomainError::validation(format!("invalid price {}", item.price)).into());
        }

        let mut items = self.get_cart(user_id)?;
        match items.iter_mut().find(|line| line.product_id == item.product_id) {
            Some(line) => {
                line.quantity = line.quantity.saturating_add(item.quantity);
                line.price = item.price;
            }
            None => items.push(item),
        }

        self.store(user_id, &items)?;
        Ok(items)
    }

    /// Drop every line for `product_id`. Removing the last line deletes the cart.
    #[instrument(skip(self), fields(user_id = %user_id, product_id = %product_id), err)]
    pub fn remove_from_cart(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> CartResult<Vec<CartItem>> {
        let mut items = self.get_cart(user_id)?;
        items.retain(|line| &line.product_id != product_id);

        if items.is_empty() {
            self.clear_cart(user_id)?;
        } else {
            self.store(user_id, &items)?;
        }
        Ok(items)
    }

    pub fn clear_cart(&self, user_id: &UserId) -> CartResult<()> {
        self.cache.delete(&cart_key(user_id))?;
        debug!(%user_id, "cart cleared");
        Ok(())
    }

    fn store(&self, user_id: &UserId, items: &[CartItem]) -> CartResult<()> {
        let raw = serde_json::to_string(items).map_err(|e| CartError::Corrupt {
            user_id: user_id.clone(),
            reason: e.to_string(),
        })?;
        self.cache.set(&cart_key(user_id), &raw, CART_TTL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_events::InMemoryCache;

    fn carts() -> (CartService, Arc<InMemoryCache>) {
        let cache = Arc::new(InMemoryCache::new());
        (CartService::new(cache.clone()), cache)
    }

    fn item(product: &str, quantity: u32, price: f64) -> CartItem {
        CartItem {
            product_id: ProductId::new(product).unwrap(),
            quantity,
            price,
        }
    }

    fn user() -> UserId {
        UserId::new("U1").unwrap()
    }

    #[test]
    fn missing_cart_reads_empty() {
        let (carts, _cache) = carts();
        assert!(carts.get_cart(&user()).unwrap().is_empty());
    }

    #[test]
    fn adding_a_product_twice_merges_quantity_and_takes_latest_price() {
        let (carts, cache) = carts();
        carts.add_to_cart(&user(), item("P1", 2, 5.0)).unwrap();
        carts.add_to_cart(&user(), item("P2", 1, 3.0)).unwrap();

        let items = carts.add_to_cart(&user(), item("P1", 3, 4.5)).unwrap();
        assert_eq!(items, vec![item("P1", 5, 4.5), item("P2", 1, 3.0)]);
        assert_eq!(carts.get_cart(&user()).unwrap(), items);

        let raw = cache.get("cart:U1").unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored[0]["product_id"], "P1");
        assert_eq!(stored[0]["quantity"], 5);
    }

    #[test]
    fn removing_the_last_line_deletes_the_key() {
        let (carts, cache) = carts();
        carts.add_to_cart(&user(), item("P1", 1, 1.0)).unwrap();
        carts.add_to_cart(&user(), item("P2", 1, 1.0)).unwrap();

        let left = carts.remove_from_cart(&user(), &ProductId::new("P1").unwrap()).unwrap();
        assert_eq!(left, vec![item("P2", 1, 1.0)]);
        assert!(cache.contains("cart:U1"));

        let left = carts.remove_from_cart(&user(), &ProductId::new("P2").unwrap()).unwrap();
        assert!(left.is_empty());
        assert!(!cache.contains("cart:U1"));
    }

    #[test]
    fn clear_cart_removes_everything() {
        let (carts, cache) = carts();
        carts.add_to_cart(&user(), item("P1", 1, 1.0)).unwrap();
        carts.clear_cart(&user()).unwrap();
        assert!(!cache.contains("cart:U1"));
        // Clearing an absent cart is fine.
        carts.clear_cart(&user()).unwrap();
    }

    #[test]
    fn carts_are_per_user() {
        let (carts, _cache) = carts();
        let other = UserId::new("U2").unwrap();
        carts.add_to_cart(&user(), item("P1", 1, 1.0)).unwrap();
        assert!(carts.get_cart(&other).unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_lines() {
        let (carts, _cache) = carts();
        assert!(matches!(
            carts.add_to_cart(&user(), item("P1", 0, 1.0)),
            Err(CartError::Domain(DomainError::Validation(_)))
        ));
        assert!(matches!(
            carts.add_to_cart(&user(), item("P1", 1, -1.0)),
            Err(CartError::Domain(DomainError::Validation(_)))
        ));
    }

    #[test]
    fn unreadable_cart_is_reported() {
        let (carts, cache) = carts();
        cache.set("cart:U1", "not json", CART_TTL).unwrap();
        assert!(matches!(carts.get_cart(&user()), Err(CartError::Corrupt { .. })));
    }
}
