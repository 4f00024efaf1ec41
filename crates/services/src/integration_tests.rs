//! End-to-end flows across services over the in-memory broker.
//!
//! Each test starts the real consumers (topology, workers, dispatch) the
//! worker binaries start, only with in-memory broker and dedup store.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use marketflow_core::UserId;
    use marketflow_events::{
        Consumer, DedupFilter, Envelope, InMemoryBroker, InMemoryDedupStore, MessageBroker,
        Publisher, Topology, UserRegistered, exchanges, names, queues,
    };

    use crate::catalog::{CatalogService, NewProduct};
    use crate::notifications::{NotificationService, admin_user_id};
    use crate::orders::{OrderItem, OrderService};

    const TICK: Duration = Duration::from_millis(10);

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn identical_redelivery_notifies_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let notifications = Arc::new(NotificationService::new());
        let dedup = DedupFilter::new(Arc::new(InMemoryDedupStore::new()));

        let handle = Consumer::new(
            Topology::notification_service(),
            notifications.handlers().unwrap(),
        )
        .with_dedup(dedup)
        .with_shutdown_tick(TICK)
        .start(&broker)
        .unwrap();

        let user_id = UserId::new("U1").unwrap();
        let body = Envelope::new(
            names::USER_REGISTERED,
            UserRegistered {
                user_id: user_id.clone(),
                username: "ada".to_string(),
                email: "ada@example.com".to_string(),
            },
        )
        .unwrap()
        .to_vec()
        .unwrap();

        broker.publish(exchanges::USER, names::USER_REGISTERED, &body).unwrap();
        broker.publish(exchanges::USER, names::USER_REGISTERED, &body).unwrap();

        wait_until(|| {
            handle
                .stats(queues::USER_REGISTERED_NOTIFY)
                .is_some_and(|s| s.received == 2)
        });
        let stats = handle.stats(queues::USER_REGISTERED_NOTIFY).unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(notifications.for_user(&user_id).len(), 1);

        handle.shutdown();
    }

    #[test]
    fn without_dedup_redelivery_notifies_twice() {
        let broker = Arc::new(InMemoryBroker::new());
        let notifications = Arc::new(NotificationService::new());
        let handle = Consumer::new(
            Topology::notification_service(),
            notifications.handlers().unwrap(),
        )
        .with_shutdown_tick(TICK)
        .start(&broker)
        .unwrap();

        let body = Envelope::new(
            names::ORDER_COMPLETED,
            serde_json::json!({"order_id": "O1", "user_id": "U1"}),
        )
        .unwrap()
        .to_vec()
        .unwrap();
        broker.publish(exchanges::ORDER, names::ORDER_COMPLETED, &body).unwrap();
        broker.publish(exchanges::ORDER, names::ORDER_COMPLETED, &body).unwrap();

        let user_id = UserId::new("U1").unwrap();
        wait_until(|| notifications.for_user(&user_id).len() == 2);
        handle.shutdown();
    }

    #[test]
    fn placing_an_order_that_empties_stock_alerts_the_admin() {
        let broker = Arc::new(InMemoryBroker::new());

        let catalog = Arc::new(CatalogService::new(
            Publisher::connect(broker.clone(), exchanges::PRODUCT).unwrap(),
        ));
        let orders = Arc::new(OrderService::new(
            Publisher::connect(broker.clone(), exchanges::ORDER).unwrap(),
        ));
        let notifications = Arc::new(NotificationService::new());

        let catalog_worker = Consumer::new(Topology::catalog_service(), catalog.handlers().unwrap())
            .with_shutdown_tick(TICK)
            .start(&broker)
            .unwrap();
        let order_worker = Consumer::new(Topology::order_service(), orders.handlers().unwrap())
            .with_shutdown_tick(TICK)
            .start(&broker)
            .unwrap();
        let notification_worker = Consumer::new(
            Topology::notification_service(),
            notifications.handlers().unwrap(),
        )
        .with_dedup(DedupFilter::new(Arc::new(InMemoryDedupStore::new())))
        .with_shutdown_tick(TICK)
        .start(&broker)
        .unwrap();

        let product = catalog
            .create_product(NewProduct {
                name: "Widget".to_string(),
                description: String::new(),
                price: 2.0,
                quantity: 5,
            })
            .unwrap();
        let user_id = UserId::new("U1").unwrap();
        orders
            .place_order(
                user_id.clone(),
                vec![OrderItem {
                    product_id: product.id.clone(),
                    quantity: 5,
                    price: 2.0,
                }],
            )
            .unwrap();

        let admin = admin_user_id();
        wait_until(|| notifications.for_user(&admin).len() == 1);
        wait_until(|| orders.low_stock_products().len() == 1);
        wait_until(|| notifications.for_user(&user_id).len() == 1);

        assert_eq!(catalog.stock(&product.id).unwrap().quantity, 0);
        assert_eq!(notifications.for_user(&admin)[0].subject, "Stock Alert: Widget");
        assert_eq!(notifications.for_user(&user_id)[0].subject, "Order Confirmation");

        let low = orders.low_stock_products();
        assert_eq!(low[0].product_id, product.id);
        assert_eq!(low[0].quantity_remaining, 0);

        for handle in [catalog_worker, order_worker, notification_worker] {
            handle.shutdown();
        }
    }
}
