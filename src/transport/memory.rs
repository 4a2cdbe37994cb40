use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    Broker, Channel, Connection, Delivery, DeliveryStream, Properties, QueueOptions,
};

pub const MEMORY_URI_SCHEME: &str = "memory://";
pub const DEFAULT_URI: &str = "memory://localhost";

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: Properties,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<u64>,
    next_consumer: usize,
    owner: Option<u64>,
    had_consumers: bool,
    last_used: Instant,
}

impl QueueState {
    fn is_expired(&self, now: Instant) -> bool {
        match self.options.expires {
            Some(expires) => {
                self.consumers.is_empty() && now.duration_since(self.last_used) >= expires
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct ConsumerState {
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    auto_ack: bool,
    prefetch: u16,
    unacked: usize,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.unacked < self.prefetch as usize
    }
}

#[derive(Debug)]
struct Unacked {
    consumer: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    prefetch_count: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    open: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct BrokerCore {
    queues: HashMap<String, QueueState>,
    consumers: HashMap<u64, ConsumerState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, Arc<AtomicBool>>,
}

impl BrokerCore {
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.queues.retain(|name, queue| {
            let expired = queue.is_expired(now);
            if expired {
                debug!(queue = %name, "queue expired");
            }
            !expired
        });
    }

    /// Hand ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerCore {
            queues,
            consumers,
            channels,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| {
                    consumers
                        .get(&queue.consumers[*idx])
                        .is_some_and(ConsumerState::has_capacity)
                });
            let Some(idx) = chosen else {
                break;
            };
            let consumer_id = queue.consumers[idx];
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            let delivered = match consumers.get_mut(&consumer_id) {
                Some(consumer) => match channels.get_mut(&consumer.channel) {
                    Some(channel) => {
                        let tag = channel.next_tag;
                        let delivery = Delivery {
                            body: message.body.clone(),
                            properties: message.properties.clone(),
                            routing_key: message.routing_key.clone(),
                            delivery_tag: tag,
                            redelivered: message.redelivered,
                        };
                        if consumer.tx.send(delivery).is_ok() {
                            channel.next_tag += 1;
                            if !consumer.auto_ack {
                                consumer.unacked += 1;
                                channel.unacked.insert(
                                    tag,
                                    Unacked {
                                        consumer: consumer_id,
                                        queue: queue_name.to_string(),
                                        message: message.clone(),
                                    },
                                );
                            }
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                },
                None => false,
            };

            if delivered {
                queue.last_used = Instant::now();
            } else {
                // Consumer went away without cancelling; forget it.
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                consumers.remove(&consumer_id);
                queue.next_consumer = match queue.consumers.len() {
                    0 => 0,
                    len => queue.next_consumer % len,
                };
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) -> String {
        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
        unacked.queue
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        channel.open.store(false, Ordering::Release);

        let mut touched: Vec<String> = Vec::new();

        // Unacknowledged messages go back to the head of their queues in
        // their original order.
        for (_, unacked) in channel.unacked.into_iter().rev() {
            let queue = self.requeue(unacked);
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }

        let cancelled: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.channel == channel_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in &cancelled {
            self.consumers.remove(consumer_id);
        }

        let mut auto_deleted = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|id| !cancelled.contains(id));
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                queue.last_used = Instant::now();
                let abandoned = queue.consumers.is_empty() && queue.had_consumers;
                if queue.options.auto_delete && abandoned {
                    auto_deleted.push(name.clone());
                } else if !touched.contains(name) {
                    touched.push(name.clone());
                }
            }
        }
        for name in &auto_deleted {
            debug!(queue = %name, "auto-delete queue removed");
            self.queues.remove(name);
        }

        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(open) = self.connections.remove(&connection_id) {
            open.store(false, Ordering::Release);
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }

        self.queues
            .retain(|_, queue| queue.owner != Some(connection_id));
    }
}

#[derive(Debug)]
struct BrokerShared {
    name: String,
    core: Mutex<BrokerCore>,
    next_id: AtomicU64,
    pending_failures: AtomicUsize,
    pending_channel_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl BrokerShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// In-process broker with AMQP-like queue semantics: default-exchange
/// routing by queue name, per-consumer prefetch, manual acknowledgement,
/// redelivery of unacknowledged messages when their channel closes, and
/// exclusive, auto-delete and expiring queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                name: name.into(),
                core: Mutex::new(BrokerCore::default()),
                next_id: AtomicU64::new(1),
                pending_failures: AtomicUsize::new(0),
                pending_channel_failures: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.pending_failures.store(count, Ordering::Release);
    }

    /// Make the next `count` channel opens fail on an otherwise open
    /// connection.
    pub fn fail_next_channel_opens(&self, count: usize) {
        self.shared
            .pending_channel_failures
            .store(count, Ordering::Release);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::Acquire)
    }

    /// Drop every open connection, as a broker restart would.
    pub fn disconnect_all(&self) {
        let mut core = self.shared.core.lock();
        let ids: Vec<u64> = core.connections.keys().copied().collect();
        for id in ids {
            core.close_connection(id);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        let mut core = self.shared.core.lock();
        core.sweep_expired();
        core.queues.contains_key(name)
    }

    /// Messages waiting for a consumer, excluding unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        let core = self.shared.core.lock();
        core.queues.get(name).map(|queue| queue.messages.len())
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        let core = self.shared.core.lock();
        core.queues.get(name).map(|queue| queue.options.clone())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        let core = self.shared.core.lock();
        core.queues
            .get(name)
            .map(|queue| queue.consumers.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        let core = self.shared.core.lock();
        core.channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.core.lock().connections.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, uri: &str) -> TransportResult<Arc<dyn Connection>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::AcqRel);

        if !uri.starts_with(MEMORY_URI_SCHEME) {
            let reason = format!("unsupported uri for memory broker: {}", uri);
            return Err(TransportError::Broker(reason));
        }

        let failing = self.shared.pending_failures.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |remaining| remaining.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(TransportError::Broker("connection refused".into()));
        }

        let id = self.shared.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.shared.core.lock().connections.insert(id, open.clone());

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            shared: self.shared.clone(),
        }))
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    shared: Arc<BrokerShared>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn open_channel(
        &self,
        _prefetch_size: u32,
        prefetch_count: u16,
    ) -> TransportResult<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let failing = self.shared.pending_channel_failures.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |remaining| remaining.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(TransportError::Broker("channel open refused".into()));
        }

        let id = self.shared.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.shared.core.lock().channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch_count,
                next_tag: 1,
                unacked: BTreeMap::new(),
                open: open.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            open,
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.core.lock().close_connection(self.id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    open: Arc<AtomicBool>,
    shared: Arc<BrokerShared>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    fn settle(&self, delivery_tag: u64) -> TransportResult<(BrokerCoreGuard<'_>, Unacked)> {
        self.ensure_open()?;
        let mut core = self.shared.core.lock();
        let unacked = core
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(delivery_tag))?;
        Ok((core, unacked))
    }
}

type BrokerCoreGuard<'a> = parking_lot::MutexGuard<'a, BrokerCore>;

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> TransportResult<String> {
        self.ensure_open()?;
        let mut core = self.shared.core.lock();
        core.sweep_expired();

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(queue) = core.queues.get_mut(&name) {
            if queue.owner.is_some_and(|owner| owner != self.connection) {
                let reason = format!("queue {} is exclusive to another connection", name);
                return Err(TransportError::Broker(reason));
            }
            queue.last_used = Instant::now();
            return Ok(name);
        }

        core.queues.insert(
            name.clone(),
            QueueState {
                options: options.clone(),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                owner: options.exclusive.then_some(self.connection),
                had_consumers: false,
                last_used: Instant::now(),
            },
        );
        debug!(queue = %name, ?options, "queue declared");
        Ok(name)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        if !exchange.is_empty() {
            let reason = format!("exchange {} not found", exchange);
            return Err(TransportError::Broker(reason));
        }

        let mut core = self.shared.core.lock();
        core.sweep_expired();

        let Some(queue) = core.queues.get_mut(routing_key) else {
            debug!(routing_key, "unroutable message dropped");
            return Ok(());
        };
        queue.messages.push_back(StoredMessage {
            body,
            properties,
            routing_key: routing_key.to_string(),
            redelivered: false,
        });
        queue.last_used = Instant::now();

        core.dispatch(routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> TransportResult<DeliveryStream> {
        self.ensure_open()?;
        let mut core = self.shared.core.lock();
        core.sweep_expired();

        let prefetch = core
            .channels
            .get(&self.id)
            .map(|channel| channel.prefetch_count)
            .ok_or(TransportError::ChannelClosed)?;

        let consumer_id = self.shared.next_id();
        let state = core
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        if state.owner.is_some_and(|owner| owner != self.connection) {
            let reason = format!("queue {} is exclusive to another connection", queue);
            return Err(TransportError::Broker(reason));
        }
        state.consumers.push(consumer_id);
        state.had_consumers = true;
        state.last_used = Instant::now();

        let (tx, rx) = mpsc::unbounded_channel();
        core.consumers.insert(
            consumer_id,
            ConsumerState {
                channel: self.id,
                tx,
                auto_ack,
                prefetch,
                unacked: 0,
            },
        );
        core.dispatch(queue);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        let (mut core, unacked) = self.settle(delivery_tag)?;
        if let Some(consumer) = core.consumers.get_mut(&unacked.consumer) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        core.dispatch(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        let (mut core, unacked) = self.settle(delivery_tag)?;
        if requeue {
            let queue = core.requeue(unacked);
            core.dispatch(&queue);
        } else {
            if let Some(consumer) = core.consumers.get_mut(&unacked.consumer) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            debug!(queue = %unacked.queue, delivery_tag, "message rejected");
            core.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.core.lock().close_channel(self.id);
        Ok(())
    }
}
