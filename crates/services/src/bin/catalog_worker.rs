use std::sync::Arc;

use marketflow_events::{Consumer, Publisher, Topology, exchanges};
use marketflow_services::catalog::CatalogService;
use marketflow_services::worker::Worker;

fn main() -> anyhow::Result<()> {
    let worker = Worker::bootstrap("catalog-service")?;

    let publisher = Publisher::connect(worker.broker.clone(), exchanges::PRODUCT)?;
    let catalog = Arc::new(CatalogService::new(publisher).with_cache(worker.shared_cache()?));
    let consumer = Consumer::new(Topology::catalog_service(), catalog.handlers()?);

    worker.run(consumer)
}
