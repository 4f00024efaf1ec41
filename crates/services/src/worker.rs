//! Process bootstrap shared by the worker binaries.
//!
//! A worker initialises logging, loads configuration, connects the AMQP
//! broker on its own tokio runtime, starts a [`Consumer`] and runs until
//! Ctrl-C. Any startup failure is returned to `main` and ends the process.

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use marketflow_events::{Consumer, DedupFilter, KeyValueCache, MessageBroker};
use marketflow_infra::Config;
use marketflow_infra::cache::RedisCache;
use marketflow_infra::dedup::RedisDedupStore;
use marketflow_infra::event_bus::AmqpBroker;

pub struct Worker {
    pub service: &'static str,
    pub config: Config,
    pub broker: Arc<AmqpBroker>,
    runtime: Runtime,
}

impl Worker {
    /// Logging, configuration and broker connection for `service`.
    pub fn bootstrap(service: &'static str) -> anyhow::Result<Self> {
        marketflow_observability::init(service);

        let config = Config::from_env().context("loading configuration")?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name(format!("{service}-io"))
            .build()
            .context("building tokio runtime")?;

        let broker = AmqpBroker::connect(&config.broker, runtime.handle().clone())
            .context("connecting to the message broker")?;

        Ok(Self {
            service,
            config,
            broker: Arc::new(broker),
            runtime,
        })
    }

    /// The Redis-backed dedup filter, or `None` when `DEDUP_ENABLED=false`.
    ///
    /// Redis must answer `PING` at startup when dedup is enabled.
    pub fn dedup_filter(&self) -> anyhow::Result<Option<DedupFilter>> {
        if !self.config.dedup.enabled {
            warn!("deduplication disabled; every delivery is treated as new");
            return Ok(None);
        }
        let store = RedisDedupStore::connect(&self.config.redis).context("connecting to redis")?;
        Ok(Some(DedupFilter::with_ttl(Arc::new(store), self.config.dedup.ttl)))
    }

    /// The Redis cache shared with the other instances of this service.
    pub fn shared_cache(&self) -> anyhow::Result<Arc<dyn KeyValueCache>> {
        let cache = RedisCache::connect(&self.config.redis).context("connecting cache to redis")?;
        Ok(Arc::new(cache))
    }

    /// Start `consumer` and block until Ctrl-C, then stop the workers and close
    /// the broker connection.
    pub fn run(self, consumer: Consumer) -> anyhow::Result<()> {
        let handle = consumer
            .start(&self.broker)
            .context("starting the consumer")?;
        info!(service = self.service, queues = ?handle.queues().collect::<Vec<_>>(), "worker running");

        self.runtime
            .block_on(tokio::signal::ctrl_c())
            .context("waiting for shutdown signal")?;

        info!(service = self.service, "shutting down");
        handle.shutdown();
        self.broker.close().context("closing the broker")?;
        Ok(())
    }
}
