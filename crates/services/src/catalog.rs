//! Catalog: products and their stock levels.
//!
//! Products and inventory are separate records, as in a product table with a
//! side inventory table; a stock level can outlive its product row. Every
//! stock change publishes `inventory.updated`, and a decrement that empties a
//! product also publishes `product.out_of_stock`.
//!
//! The catalog consumes `order.created` on `order.created.product` and
//! decrements the stock of each ordered line.
//!
//! Product reads go through a shared cache under `product:<id>`. Any product
//! or stock change evicts the entry. Cache failures are logged and the
//! repository answers instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use marketflow_core::{DomainError, DomainResult, ProductId};
use marketflow_events::{
    HandlerRegistry, InMemoryCache, InventoryUpdated, KeyValueCache, MessageBroker, OrderCreated,
    ProductCreated, ProductOutOfStock, Publisher, RegistryError,
};
use serde::{Deserialize, Serialize};

use crate::publish_or_warn;
use crate::store::{InMemoryRepository, Repository};

/// Stock strictly below this is reported as low.
pub const LOW_STOCK_THRESHOLD: u32 = 10;

pub fn is_low_stock(quantity: u32) -> bool {
    quantity < LOW_STOCK_THRESHOLD
}

pub const PRODUCT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

pub fn product_cache_key(id: &ProductId) -> String {
    format!("product:{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub quantity: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub quantity: u32,
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ProductChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
}

pub struct CatalogService<B> {
    products: Arc<dyn Repository<ProductId, Product>>,
    inventory: Arc<dyn Repository<ProductId, StockLevel>>,
    cache: Arc<dyn KeyValueCache>,
    publisher: Publisher<B>,
}

impl<B> CatalogService<B>
where
    B: MessageBroker,
{
    pub fn new(publisher: Publisher<B>) -> Self {
        Self::with_stores(
            publisher,
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
        )
    }

    pub fn with_stores(
        publisher: Publisher<B>,
        products: Arc<dyn Repository<ProductId, Product>>,
        inventory: Arc<dyn Repository<ProductId, StockLevel>>,
    ) -> Self {
        Self {
            products,
            inventory,
            cache: Arc::new(InMemoryCache::new()),
            publisher,
        }
    }

    /// Serve product reads through `cache` instead of a private in-memory one.
    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Create a product with its initial stock and publish `product.created`.
    #[instrument(skip(self, input), fields(name = %input.name), err)]
    pub fn create_product(&self, input: NewProduct) -> DomainResult<Product> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("product name is required"));
        }
        validate_price(input.price)?;

        let now = Utc::now();
        let product = Product {
            id: ProductId::generate(),
            name: name.to_string(),
            description: input.description,
            price: input.price,
            created_at: now,
            updated_at: now,
        };
        self.products.upsert(product.id.clone(), product.clone());
        self.inventory.upsert(
            product.id.clone(),
            StockLevel {
                product_id: product.id.clone(),
                quantity: input.quantity,
                updated_at: now,
            },
        );
        info!(product_id = %product.id, quantity = input.quantity, "product created");
        self.cache_product(&product);

        publish_or_warn(
            &self.publisher,
            &ProductCreated {
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                price: product.price,
            },
        );

        Ok(product)
    }

    /// Read-through: a cache hit skips the repository, a miss fills the cache.
    pub fn get_product(&self, id: &ProductId) -> DomainResult<Product> {
        if let Some(product) = self.cached_product(id) {
            return Ok(product);
        }
        let product = self
            .products
            .get(id)
            .ok_or_else(|| DomainError::not_found(format!("product {id}")))?;
        self.cache_product(&product);
        Ok(product)
    }

    /// Every product, ordered by name.
    pub fn list_products(&self) -> Vec<Product> {
        let mut products = self.products.list();
        products.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        products
    }

    pub fn update_product(&self, id: &ProductId, changes: ProductChanges) -> DomainResult<Product> {
        if let Some(price) = changes.price {
            validate_price(price)?;
        }
        if matches!(&changes.name, Some(name) if name.trim().is_empty()) {
            return Err(DomainError::validation("product name is required"));
        }

        let product = self
            .products
            .update(id, &mut |product| {
                if let Some(name) = &changes.name {
                    product.name = name.trim().to_string();
                }
                if let Some(description) = &changes.description {
                    product.description = description.clone();
                }
                if let Some(price) = changes.price {
                    product.price = price;
                }
                product.updated_at = Utc::now();
            })
            .ok_or_else(|| DomainError::not_found(format!("product {id}")))?;

        self.evict_product(id);
        self.cache_product(&product);
        Ok(product)
    }

    pub fn stock(&self, id: &ProductId) -> DomainResult<StockLevel> {
        self.inventory
            .get(id)
            .ok_or_else(|| DomainError::not_found(format!("stock for product {id}")))
    }

    /// Set the stock level and publish `inventory.updated`.
    #[instrument(skip(self), fields(product_id = %id), err)]
    pub fn update_stock(&self, id: &ProductId, quantity: u32) -> DomainResult<StockLevel> {
        let level = self
            .inventory
            .update(id, &mut |level| {
                level.quantity = quantity;
                level.updated_at = Utc::now();
            })
            .ok_or_else(|| DomainError::not_found(format!("stock for product {id}")))?;

        self.evict_product(id);
        self.publish_inventory(&level);
        Ok(level)
    }

    /// Remove `amount` units, clamping at zero, and return the new level.
    ///
    /// Publishes `inventory.updated`; when the product is now empty also
    /// publishes `product.out_of_stock`.
    #[instrument(skip(self), fields(product_id = %id), err)]
    pub fn decrement_stock(&self, id: &ProductId, amount: u32) -> DomainResult<StockLevel> {
        let level = self
            .inventory
            .update(id, &mut |level| {
                level.quantity = level.quantity.saturating_sub(amount);
                level.updated_at = Utc::now();
            })
            .ok_or_else(|| DomainError::not_found(format!("stock for product {id}")))?;

        self.evict_product(id);
        self.publish_inventory(&level);

        if level.quantity == 0 {
            let product_name = self
                .products
                .get(id)
                .map(|p| p.name)
                .unwrap_or_else(|| id.to_string());
            warn!(%product_name, "product out of stock");
            publish_or_warn(
                &self.publisher,
                &ProductOutOfStock {
                    product_id: id.clone(),
                    product_name,
                },
            );
        }

        Ok(level)
    }

    /// Apply an `order.created` event: one decrement per line.
    ///
    /// A failing line is logged and skipped; the remaining lines still apply.
    pub fn apply_order(&self, order: &OrderCreated) {
        for line in &order.items {
            if let Err(e) = self.decrement_stock(&line.product_id, line.quantity) {
                warn!(
                    order_id = %order.order_id,
                    product_id = %line.product_id,
                    error = %e,
                    "failed to decrement stock for order line"
                );
            }
        }
    }

    fn cached_product(&self, id: &ProductId) -> Option<Product> {
        let key = product_cache_key(id);
        match self.cache.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(product) => Some(product),
                Err(e) => {
                    warn!(%key, error = %e, "discarding unreadable cached product");
                    self.evict_product(id);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "product cache read failed");
                None
            }
        }
    }

    fn cache_product(&self, product: &Product) {
        let key = product_cache_key(&product.id);
        let stored = serde_json::to_string(product)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.cache
                    .set(&key, &raw, PRODUCT_CACHE_TTL)
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = stored {
            warn!(%key, %error, "product not cached");
        }
    }

    fn evict_product(&self, id: &ProductId) {
        let key = product_cache_key(id);
        if let Err(e) = self.cache.delete(&key) {
            warn!(%key, error = %e, "product cache eviction failed");
        }
    }

    fn publish_inventory(&self, level: &StockLevel) {
        publish_or_warn(
            &self.publisher,
            &InventoryUpdated {
                product_id: level.product_id.clone(),
                quantity_remaining: level.quantity,
                is_low_stock: is_low_stock(level.quantity),
            },
        );
    }
}

impl<B> CatalogService<B>
where
    B: MessageBroker + 'static,
{
    /// Handlers for the catalog's queues.
    pub fn handlers(self: &Arc<Self>) -> Result<HandlerRegistry, RegistryError> {
        let catalog = Arc::clone(self);
        HandlerRegistry::builder()
            .on::<OrderCreated, _>(move |order, _meta| {
                info!(order_id = %order.order_id, lines = order.items.len(), "processing order");
                catalog.apply_order(order);
                Ok(())
            })
            .build()
    }
}

fn validate_price(price: f64) -> DomainResult<()> {
    if price.is_finite() && price >= 0.0 {
        Ok(())
    } else {
        Err(DomainError::validation(format!("invalid price {price}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_drained, next_envelope, tap};
    use marketflow_core::{OrderId, UserId};
    use marketflow_events::{InMemoryBroker, OrderLine, exchanges, names};
    use proptest::prelude::*;
    use serde_json::json;

    type Catalog = CatalogService<Arc<InMemoryBroker>>;

    fn catalog() -> (Catalog, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = Publisher::connect(broker.clone(), exchanges::PRODUCT).unwrap();
        (CatalogService::new(publisher), broker)
    }

    fn cached_catalog() -> (Catalog, Arc<InMemoryCache>) {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = Publisher::connect(broker, exchanges::PRODUCT).unwrap();
        let cache = Arc::new(InMemoryCache::new());
        (CatalogService::new(publisher).with_cache(cache.clone()), cache)
    }

    fn seed(catalog: &Catalog, id: &str, name: &str, quantity: u32) -> ProductId {
        let id = ProductId::new(id).unwrap();
        let now = Utc::now();
        catalog.products.upsert(
            id.clone(),
            Product {
                id: id.clone(),
                name: name.to_string(),
                description: String::new(),
                price: 1.0,
                created_at: now,
                updated_at: now,
            },
        );
        catalog.inventory.upsert(
            id.clone(),
            StockLevel {
                product_id: id.clone(),
                quantity,
                updated_at: now,
            },
        );
        id
    }

    #[test]
    fn stock_exhaustion_publishes_update_then_out_of_stock() {
        let (catalog, broker) = catalog();
        let updates = tap(&broker, exchanges::PRODUCT, names::INVENTORY_UPDATED);
        let empty = tap(&broker, exchanges::PRODUCT, names::PRODUCT_OUT_OF_STOCK);
        let p1 = seed(&catalog, "P1", "Widget", 5);

        catalog.apply_order(&OrderCreated {
            order_id: OrderId::new("O1").unwrap(),
            user_id: UserId::new("U1").unwrap(),
            items: vec![OrderLine {
                product_id: p1.clone(),
                quantity: 5,
            }],
            total_amount: 5.0,
        });

        let env = next_envelope(&updates);
        assert_eq!(
            env.data(),
            &json!({"product_id": "P1", "quantity_remaining": 0, "is_low_stock": true})
        );
        let env = next_envelope(&empty);
        assert_eq!(env.data(), &json!({"product_id": "P1", "product_name": "Widget"}));
        assert_drained(&updates);
        assert_drained(&empty);
        assert_eq!(catalog.stock(&p1).unwrap().quantity, 0);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let (catalog, _broker) = catalog();
        let p1 = seed(&catalog, "P1", "Widget", 3);
        assert_eq!(catalog.decrement_stock(&p1, 7).unwrap().quantity, 0);
    }

    #[test]
    fn out_of_stock_falls_back_to_id_without_product_row() {
        let (catalog, broker) = catalog();
        let empty = tap(&broker, exchanges::PRODUCT, names::PRODUCT_OUT_OF_STOCK);
        let id = ProductId::new("orphan").unwrap();
        catalog.inventory.upsert(
            id.clone(),
            StockLevel {
                product_id: id.clone(),
                quantity: 1,
                updated_at: Utc::now(),
            },
        );

        catalog.decrement_stock(&id, 1).unwrap();

        let env = next_envelope(&empty);
        assert_eq!(env.data()["product_name"], "orphan");
    }

    #[test]
    fn low_stock_threshold_is_exclusive() {
        let (catalog, broker) = catalog();
        let updates = tap(&broker, exchanges::PRODUCT, names::INVENTORY_UPDATED);
        let empty = tap(&broker, exchanges::PRODUCT, names::PRODUCT_OUT_OF_STOCK);
        let p1 = seed(&catalog, "P1", "Widget", 20);

        catalog.update_stock(&p1, 10).unwrap();
        assert_eq!(next_envelope(&updates).data()["is_low_stock"], false);

        catalog.update_stock(&p1, 9).unwrap();
        assert_eq!(next_envelope(&updates).data()["is_low_stock"], true);

        assert_drained(&empty);
    }

    #[test]
    fn decrement_reports_low_stock_below_ten_only() {
        let (catalog, broker) = catalog();
        let updates = tap(&broker, exchanges::PRODUCT, names::INVENTORY_UPDATED);
        let empty = tap(&broker, exchanges::PRODUCT, names::PRODUCT_OUT_OF_STOCK);
        let low = seed(&catalog, "P1", "Widget", 19);
        let fine = seed(&catalog, "P2", "Gadget", 20);

        catalog.decrement_stock(&low, 10).unwrap();
        assert_eq!(
            next_envelope(&updates).data(),
            &json!({"product_id": "P1", "quantity_remaining": 9, "is_low_stock": true})
        );

        catalog.decrement_stock(&fine, 10).unwrap();
        assert_eq!(
            next_envelope(&updates).data(),
            &json!({"product_id": "P2", "quantity_remaining": 10, "is_low_stock": false})
        );

        assert_drained(&updates);
        assert_drained(&empty);
    }

    #[test]
    fn product_reads_are_served_from_cache_until_stock_changes() {
        let (catalog, cache) = cached_catalog();
        let p1 = seed(&catalog, "P1", "Widget", 5);
        let key = product_cache_key(&p1);
        assert!(!cache.contains(&key));

        let first = catalog.get_product(&p1).unwrap();
        assert!(cache.contains(&key));

        // A write behind the service's back stays invisible while cached.
        catalog.products.upsert(
            p1.clone(),
            Product {
                name: "Renamed".to_string(),
                ..first.clone()
            },
        );
        assert_eq!(catalog.get_product(&p1).unwrap(), first);

        catalog.update_stock(&p1, 4).unwrap();
        assert!(!cache.contains(&key));
        assert_eq!(catalog.get_product(&p1).unwrap().name, "Renamed");

        catalog.get_product(&p1).unwrap();
        catalog.decrement_stock(&p1, 1).unwrap();
        assert!(!cache.contains(&key));
    }

    #[test]
    fn product_updates_refresh_the_cached_copy() {
        let (catalog, cache) = cached_catalog();
        let product = catalog
            .create_product(NewProduct {
                name: "Lamp".to_string(),
                description: String::new(),
                price: 10.0,
                quantity: 1,
            })
            .unwrap();
        let key = product_cache_key(&product.id);
        assert!(cache.contains(&key));

        catalog
            .update_product(
                &product.id,
                ProductChanges {
                    price: Some(12.0),
                    ..ProductChanges::default()
                },
            )
            .unwrap();
        let cached: Product = serde_json::from_str(&cache.get(&key).unwrap().unwrap()).unwrap();
        assert_eq!(cached.price, 12.0);
        assert_eq!(catalog.get_product(&product.id).unwrap().price, 12.0);
    }

    #[test]
    fn unreadable_cache_entry_falls_back_to_repository() {
        let (catalog, cache) = cached_catalog();
        let p1 = seed(&catalog, "P1", "Widget", 5);
        cache
            .set(&product_cache_key(&p1), "garbage", PRODUCT_CACHE_TTL)
            .unwrap();

        assert_eq!(catalog.get_product(&p1).unwrap().name, "Widget");
    }

    #[test]
    fn failing_order_line_does_not_block_the_rest() {
        let (catalog, broker) = catalog();
        let updates = tap(&broker, exchanges::PRODUCT, names::INVENTORY_UPDATED);
        let p2 = seed(&catalog, "P2", "Gadget", 30);

        catalog.apply_order(&OrderCreated {
            order_id: OrderId::new("O1").unwrap(),
            user_id: UserId::new("U1").unwrap(),
            items: vec![
                OrderLine {
                    product_id: ProductId::new("missing").unwrap(),
                    quantity: 1,
                },
                OrderLine {
                    product_id: p2.clone(),
                    quantity: 4,
                },
            ],
            total_amount: 0.0,
        });

        assert_eq!(next_envelope(&updates).data()["product_id"], "P2");
        assert_eq!(catalog.stock(&p2).unwrap().quantity, 26);
    }

    #[test]
    fn create_product_publishes_product_created() {
        let (catalog, broker) = catalog();
        let created = tap(&broker, exchanges::PRODUCT, names::PRODUCT_CREATED);

        let product = catalog
            .create_product(NewProduct {
                name: "Lamp".to_string(),
                description: "desk lamp".to_string(),
                price: 19.5,
                quantity: 12,
            })
            .unwrap();

        let env = next_envelope(&created);
        assert_eq!(
            env.data(),
            &json!({"product_id": product.id.as_str(), "product_name": "Lamp", "price": 19.5})
        );
        assert_eq!(catalog.stock(&product.id).unwrap().quantity, 12);
    }

    #[test]
    fn update_product_applies_partial_changes() {
        let (catalog, _broker) = catalog();
        let p1 = seed(&catalog, "P1", "Widget", 1);

        let updated = catalog
            .update_product(
                &p1,
                ProductChanges {
                    price: Some(2.5),
                    ..ProductChanges::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Widget");
        assert_eq!(updated.price, 2.5);

        let missing = ProductId::new("nope").unwrap();
        assert!(matches!(
            catalog.update_product(&missing, ProductChanges::default()),
            Err(DomainError::NotFound(_))
        ));
        assert!(matches!(
            catalog.update_product(
                &p1,
                ProductChanges {
                    price: Some(f64::NAN),
                    ..ProductChanges::default()
                }
            ),
            Err(DomainError::Validation(_))
        ));
    }

    proptest! {
        #[test]
        fn low_stock_matches_threshold(quantity in 0u32..1_000) {
            prop_assert_eq!(is_low_stock(quantity), quantity < 10);
        }

        #[test]
        fn decrement_never_underflows(start in 0u32..100, amount in 0u32..200) {
            let (catalog, _broker) = catalog();
            let p = seed(&catalog, "P", "Thing", start);
            let level = catalog.decrement_stock(&p, amount).unwrap();
            prop_assert_eq!(level.quantity, start.saturating_sub(amount));
        }
    }
}
