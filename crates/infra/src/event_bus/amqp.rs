//! AMQP (RabbitMQ) broker backed by `lapin`.
//!
//! `lapin` is async; this adapter keeps the synchronous `MessageBroker` surface
//! by driving it on a tokio runtime handle owned by the binary. Each
//! subscription gets a forwarding task that pushes delivery bodies into the
//! worker's std channel, the same shape as a background pub/sub forwarder.
//!
//! Calls block on the runtime handle, so they must not be made from inside an
//! async context.

use std::sync::mpsc;

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument};

use marketflow_events::{BrokerError, Delivery, ExchangeKind, ExchangeSpec, MessageBroker, QueueBinding, Subscription};

use crate::config::BrokerConfig;

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    runtime: Handle,
}

impl core::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("connection", &self.connection.status().state())
            .finish_non_exhaustive()
    }
}

impl AmqpBroker {
    /// Dial the broker and open the single channel used for all operations.
    #[instrument(skip(config, runtime), fields(host = %config.host, port = config.port), err)]
    pub fn connect(config: &BrokerConfig, runtime: Handle) -> Result<Self, BrokerError> {
        let url = config.url();
        let (connection, channel) = runtime.block_on(async {
            let connection = Connection::connect(&url, ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            Ok::<_, BrokerError>((connection, channel))
        })?;

        info!("connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
            runtime,
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

impl MessageBroker for AmqpBroker {
    #[instrument(skip(self, exchange), fields(exchange = %exchange.name), err)]
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.runtime
            .block_on(self.channel.exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                options,
                FieldTable::default(),
            ))
            .map_err(|e| BrokerError::Topology(e.to_string()))?;
        debug!(kind = exchange.kind.as_str(), "exchange declared");
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        self.runtime
            .block_on(self.channel.queue_declare(queue, options, FieldTable::default()))
            .map_err(|e| BrokerError::Topology(e.to_string()))?;
        debug!("queue declared");
        Ok(())
    }

    #[instrument(
        skip(self, binding),
        fields(queue = %binding.queue, exchange = %binding.exchange, routing_key = %binding.routing_key),
        err
    )]
    fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.runtime
            .block_on(self.channel.queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            ))
            .map_err(|e| BrokerError::Topology(e.to_string()))?;
        debug!("queue bound");
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        // The returned confirm is dropped: publishing does not wait for the broker.
        let _confirm = self
            .runtime
            .block_on(self.channel.basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            ))
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .runtime
            .block_on(self.channel.basic_consume(queue, "", options, FieldTable::default()))
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let tag = consumer.tag().as_str().to_string();
        let (tx, rx) = mpsc::channel();
        let queue_name = queue.to_string();

        self.runtime.spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let message = Delivery::new(
                            delivery.exchange.as_str(),
                            delivery.routing_key.as_str(),
                            delivery.data,
                        );
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "delivery stream failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue_name, "delivery stream ended");
        });

        info!(consumer_tag = %tag, "consuming");
        Ok(Subscription::with_tag(rx, tag))
    }

    #[instrument(skip(self, subscription), fields(consumer_tag = subscription.tag()), err)]
    fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        let Some(tag) = subscription.tag() else {
            return Ok(());
        };
        self.ensure_open()?;
        self.runtime
            .block_on(self.channel.basic_cancel(tag, BasicCancelOptions::default()))
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        debug!("consumer cancelled");
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.runtime.block_on(async {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
                debug!(error = %e, "channel close failed");
            }
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))
        })?;
        info!("AMQP connection closed");
        Ok(())
    }
}
