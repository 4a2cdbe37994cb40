use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    Broker, Channel, Connection, Delivery, DeliveryStream, Properties, QueueOptions,
};

const REPLY_SUCCESS: u16 = 200;

fn broker_error(err: lapin::Error) -> TransportError {
    TransportError::Broker(err.to_string())
}

/// Broker backed by an AMQP 0-9-1 server such as RabbitMQ.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker").finish_non_exhaustive()
    }
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, uri: &str) -> TransportResult<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(uri, self.properties.clone())
            .await
            .map_err(broker_error)?;
        Ok(Arc::new(AmqpConnection { connection }))
    }

    fn name(&self) -> &str {
        "amqp"
    }
}

#[derive(Debug)]
pub struct AmqpConnection {
    connection: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    /// lapin only exposes the per-consumer prefetch count; the byte window
    /// is left to the server default.
    async fn open_channel(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> TransportResult<Arc<dyn Channel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(broker_error)?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(broker_error)?;
        if prefetch_size != 0 {
            debug!(
                prefetch_size,
                "prefetch size is not applied by the amqp transport"
            );
        }
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(broker_error)
    }
}

#[derive(Debug)]
pub struct AmqpChannel {
    channel: lapin::Channel,
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(expires) = options.expires {
        let millis = i64::try_from(expires.as_millis()).unwrap_or(i64::MAX);
        arguments.insert("x-expires".into(), AMQPValue::LongLongInt(millis));
    }
    arguments
}

fn to_amqp_properties(properties: Properties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to));
    }
    amqp
}

fn from_amqp_properties(properties: &BasicProperties) -> Properties {
    Properties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|reply_to| reply_to.as_str().to_string()),
    }
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        properties: from_amqp_properties(&delivery.properties),
        body: Bytes::from(delivery.data),
        routing_key: delivery.routing_key.as_str().to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> TransportResult<String> {
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        let queue = self
            .channel
            .queue_declare(name, declare, queue_arguments(options))
            .await
            .map_err(broker_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> TransportResult<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_amqp_properties(properties),
            )
            .await
            .map_err(broker_error)?
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> TransportResult<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(broker_error)?;

        let queue = queue.to_string();
        Ok(consumer
            .filter_map(move |delivery| {
                let delivery = match delivery {
                    Ok(delivery) => Some(from_amqp_delivery(delivery)),
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "consumer error");
                        None
                    }
                };
                futures::future::ready(delivery)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(broker_error)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(broker_error)
    }
}
