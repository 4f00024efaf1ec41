use std::sync::Arc;

use marketflow_events::{Consumer, Publisher, Topology, exchanges};
use marketflow_services::orders::OrderService;
use marketflow_services::worker::Worker;

fn main() -> anyhow::Result<()> {
    let worker = Worker::bootstrap("order-service")?;

    let publisher = Publisher::connect(worker.broker.clone(), exchanges::ORDER)?;
    let orders = Arc::new(OrderService::new(publisher));
    let consumer = Consumer::new(Topology::order_service(), orders.handlers()?);

    worker.run(consumer)
}
