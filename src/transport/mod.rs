use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportResult;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod retry;

pub use retry::RetryPolicy;

/// Message properties the RPC layer relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Inbound message handed out by a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub properties: Properties,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Queue declaration flags and arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Broker deletes the queue after this long without consumers or use.
    pub expires: Option<Duration>,
}

impl QueueOptions {
    /// Private, broker-named reply queue that dies with its consumer.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            expires: None,
        }
    }

    /// Shared operation queue that outlives its consumers until it expires.
    pub fn operation_queue(expires: Duration) -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            expires: Some(expires),
        }
    }
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Entry point of a broker: produces connections.
#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Open a single connection attempt; retries belong to the caller.
    async fn connect(&self, uri: &str) -> TransportResult<Arc<dyn Connection>>;

    /// Get broker name/identifier
    fn name(&self) -> &str {
        "unknown"
    }
}

#[async_trait]
pub trait Connection: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Open a channel with the given flow-control window applied.
    async fn open_channel(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> TransportResult<Arc<dyn Channel>>;

    async fn close(&self) -> TransportResult<()>;
}

/// Communication channel. Implementations must tolerate concurrent
/// publishes from many callers.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Declare a queue and return its name; an empty name asks the broker
    /// to generate one.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> TransportResult<String>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> TransportResult<()>;

    /// Start consuming a queue. The stream ends when the consumer is
    /// cancelled or the channel closes.
    async fn consume(&self, queue: &str, auto_ack: bool) -> TransportResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn connect(&self, uri: &str) -> TransportResult<Arc<dyn Connection>> {
        (**self).connect(uri).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
