use std::sync::Arc;

use marketflow_events::{Consumer, Topology};
use marketflow_services::notifications::NotificationService;
use marketflow_services::worker::Worker;

fn main() -> anyhow::Result<()> {
    let worker = Worker::bootstrap("notification-service")?;

    let notifications = Arc::new(NotificationService::new());
    let mut consumer = Consumer::new(Topology::notification_service(), notifications.handlers()?);
    if let Some(filter) = worker.dedup_filter()? {
        consumer = consumer.with_dedup(filter);
    }

    worker.run(consumer)
}
