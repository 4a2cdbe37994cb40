use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ServerConfig;
use crate::error::{RemoteError, Result, RpcError};
use crate::handler::{self, ExecutionMode, Handler, HandlerFn, Outcome, TypedHandler};
use crate::message::operation::OperationName;
use crate::message::types::{RpcArgs, RpcType};
use crate::message::{ReplyEnvelope, RpcMessage};
use crate::middleware::{Middleware, Next, Pipeline};
use crate::observer::{RpcObserver, TracingObserver};
use crate::session::Session;
use crate::transport::{Broker, Channel, Delivery, DeliveryStream, QueueOptions};

pub type ReceiverNext = Next<RpcMessage, Result<()>>;
pub type ResponderNext = Next<RpcMessage, Result<()>>;

#[derive(Clone)]
struct Subscription {
    handler: Arc<dyn Handler>,
    mode: ExecutionMode,
}

struct ServerInner<C: Codec> {
    session: Session,
    codec: C,
    prefetch_count: u16,
    queue_expiry: RwLock<Duration>,
    observer: RwLock<Arc<dyn RpcObserver>>,
    handlers: RwLock<HashMap<String, Subscription>>,
    receiver: RwLock<Pipeline<RpcMessage, Result<()>>>,
    responder: RwLock<Pipeline<RpcMessage, Result<()>>>,
}

impl<C: Codec> ServerInner<C> {
    fn observer(&self) -> Arc<dyn RpcObserver> {
        self.observer.read().clone()
    }

    async fn process(self: Arc<Self>, delivery: Delivery, subscription: Subscription) {
        let delivery_tag = delivery.delivery_tag;
        let Ok(channel) = self.session.channel() else {
            // Channel is gone; the broker redelivers the message elsewhere.
            debug!(delivery_tag, "session closed before delivery was processed");
            return;
        };

        let request = match RpcMessage::from_delivery(delivery) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                settle_failed(channel.as_ref(), delivery_tag).await;
                return;
            }
        };

        if request.redelivered {
            info!(
                correlation_id = %request.correlation_id(),
                queue = %request.queue,
                "processing redelivered request"
            );
        }

        let acked = Arc::new(AtomicBool::new(false));
        let pipeline = self.receiver.read().clone();
        let inner = self.clone();
        let terminal_channel = channel.clone();
        let terminal_acked = acked.clone();
        let result = pipeline
            .run(request, move |request| async move {
                inner
                    .dispatch(request, subscription, terminal_channel, terminal_acked)
                    .await
            })
            .await;

        if let Err(e) = &result {
            warn!(delivery_tag, error = %e, "request pipeline failed");
        }
        if !acked.load(Ordering::Acquire) {
            settle_failed(channel.as_ref(), delivery_tag).await;
        }
    }

    /// Terminal step of the receiver pipeline.
    async fn dispatch(
        self: Arc<Self>,
        request: RpcMessage,
        subscription: Subscription,
        channel: Arc<dyn Channel>,
        acked: Arc<AtomicBool>,
    ) -> Result<()> {
        self.observer().message_received(&request.event());

        let Subscription { handler, mode } = subscription;
        let envelope = match mode {
            ExecutionMode::Sync => handler.invoke(&request.payload),
            ExecutionMode::Async => {
                let payload = request.payload.clone();
                let worker = handler.clone();
                tokio::task::spawn_blocking(move || worker.invoke(&payload))
                    .await
                    .unwrap_or_else(|e| {
                        ReplyEnvelope::Err(RemoteError::new(
                            handler.operation().as_str(),
                            e.to_string(),
                        ))
                    })
            }
        };

        if let ReplyEnvelope::Err(remote) = &envelope {
            warn!(
                correlation_id = %request.correlation_id(),
                operation = %remote.operation,
                error = %remote.message,
                "handler failed"
            );
        }

        if request.reply_to.is_empty() {
            debug!(
                correlation_id = %request.correlation_id(),
                "request has no reply-to, no reply sent"
            );
        } else {
            let reply = RpcMessage::reply(&request, envelope.encode(&self.codec)?);
            self.clone().respond(reply).await?;
        }

        channel.ack(request.delivery_tag).await?;
        acked.store(true, Ordering::Release);
        Ok(())
    }

    async fn respond(self: Arc<Self>, reply: RpcMessage) -> Result<()> {
        let pipeline = self.responder.read().clone();
        let inner = self.clone();
        pipeline
            .run(reply, move |reply| async move {
                let payload = reply.payload.clone();
                inner
                    .session
                    .publish(&reply.queue, reply.properties(), payload)
                    .await?;
                inner.observer().responded(&reply.event());
                Ok(())
            })
            .await
    }
}

async fn settle_failed(channel: &dyn Channel, delivery_tag: u64) {
    if let Err(e) = channel.nack(delivery_tag, false).await {
        error!(delivery_tag, error = %e, "failed to reject request");
    }
}

async fn consume_requests<C: Codec>(
    inner: Weak<ServerInner<C>>,
    subscription: Subscription,
    mut deliveries: DeliveryStream,
) {
    let operation = subscription.handler.operation().to_string();
    while let Some(delivery) = deliveries.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match subscription.mode {
            ExecutionMode::Sync => inner.process(delivery, subscription.clone()).await,
            ExecutionMode::Async => {
                tokio::spawn(inner.process(delivery, subscription.clone()));
            }
        }
    }
    debug!(operation = %operation, "request consumer stopped");
}

/// Server side of request/reply RPC over a broker.
///
/// Every subscription gets its own queue, named after the operation, and
/// its own consumer. A request is acknowledged only once its reply has
/// been published, so a server that dies mid-request leaves the message
/// to be redelivered.
pub struct RpcServer<C: Codec = JsonCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for RpcServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RpcServer<JsonCodec> {
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::with_config(broker, ServerConfig::default())
    }

    pub fn with_config(broker: impl Broker + 'static, config: ServerConfig) -> Self {
        Self::with_codec_and_config(broker, JsonCodec, config)
    }
}

impl<C: Codec + Clone> RpcServer<C> {
    pub fn with_codec(broker: impl Broker + 'static, codec: C) -> Self {
        Self::with_codec_and_config(broker, codec, ServerConfig::default())
    }

    pub fn with_codec_and_config(
        broker: impl Broker + 'static,
        codec: C,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                session: Session::new(broker, config.session),
                codec,
                prefetch_count: config.prefetch_count,
                queue_expiry: RwLock::new(config.queue_expiry),
                observer: RwLock::new(Arc::new(TracingObserver)),
                handlers: RwLock::new(HashMap::new()),
                receiver: RwLock::new(Pipeline::new()),
                responder: RwLock::new(Pipeline::new()),
            }),
        }
    }

    pub fn with_observer(self, observer: impl RpcObserver + 'static) -> Self {
        self.set_observer(observer);
        self
    }

    pub fn set_observer(&self, observer: impl RpcObserver + 'static) {
        *self.inner.observer.write() = Arc::new(observer);
    }

    pub fn set_uri(&self, uri: impl Into<String>) {
        self.inner.session.set_uri(uri);
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn queue_expiry(&self) -> Duration {
        *self.inner.queue_expiry.read()
    }

    /// Connect with the configured prefetch (one unless raised).
    /// `queue_expiry` overrides the configured idle expiry of every queue
    /// subscribed afterwards.
    pub async fn setup(&self, uri: Option<&str>, queue_expiry: Option<Duration>) -> Result<()> {
        self.inner
            .session
            .open(uri, 0, self.inner.prefetch_count)
            .await?;
        if let Some(expiry) = queue_expiry {
            *self.inner.queue_expiry.write() = expiry;
        }
        info!(queue_expiry = ?self.queue_expiry(), "rpc server ready");
        Ok(())
    }

    /// Stop consuming and disconnect. Unacknowledged requests return to
    /// their queues; subscriptions must be made again after the next setup.
    pub async fn reset(&self) {
        self.inner.session.reset().await;
        self.inner.handlers.write().clear();
    }

    /// Serve `alias` with a handler whose return value is the result.
    pub async fn subscribe<A, R, H>(
        &self,
        alias: &str,
        handler: H,
        mode: ExecutionMode,
    ) -> Result<OperationName>
    where
        A: RpcArgs,
        R: RpcType,
        H: HandlerFn<A, Output = R>,
    {
        let operation = OperationName::of::<A, R>(alias)?;
        let func = handler::returning(&operation, handler);
        self.register::<A, _>(operation, func, mode).await
    }

    /// Serve `alias` with a handler returning `Result<R, E>`; an `Err` is
    /// sent back as a remote error.
    pub async fn subscribe_fallible<A, R, E, H>(
        &self,
        alias: &str,
        handler: H,
        mode: ExecutionMode,
    ) -> Result<OperationName>
    where
        A: RpcArgs,
        R: RpcType,
        E: Display + Debug,
        H: HandlerFn<A, Output = std::result::Result<R, E>>,
    {
        let operation = OperationName::of::<A, R>(alias)?;
        let func = handler::fallible(&operation, handler);
        self.register::<A, _>(operation, func, mode).await
    }

    async fn register<A, F>(
        &self,
        operation: OperationName,
        func: F,
        mode: ExecutionMode,
    ) -> Result<OperationName>
    where
        A: RpcArgs,
        F: Fn(A) -> Outcome + Send + Sync + 'static,
    {
        let subscription = Subscription {
            handler: Arc::new(TypedHandler::<C, A, F>::new(
                operation.clone(),
                self.inner.codec.clone(),
                func,
            )),
            mode,
        };

        {
            let mut handlers = self.inner.handlers.write();
            if handlers.contains_key(operation.as_str()) {
                return Err(RpcError::AlreadySubscribed(operation.to_string()));
            }
            handlers.insert(operation.to_string(), subscription.clone());
        }

        if let Err(e) = self.start_consumer(&operation, subscription).await {
            self.inner.handlers.write().remove(operation.as_str());
            return Err(e);
        }

        info!(operation = %operation, ?mode, "subscribed");
        Ok(operation)
    }

    async fn start_consumer(
        &self,
        operation: &OperationName,
        subscription: Subscription,
    ) -> Result<()> {
        let session = &self.inner.session;
        let options = QueueOptions::operation_queue(self.queue_expiry());
        let queue = session.declare_queue(operation.as_str(), &options).await?;
        let deliveries = session.consume(&queue, false).await?;
        let consumer = consume_requests(Arc::downgrade(&self.inner), subscription, deliveries);
        session.spawn_consumer(consumer)?;
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_subscribed(&self, operation: &str) -> bool {
        self.inner.handlers.read().contains_key(operation)
    }

    /// Register a step wrapping the handling of every inbound request.
    pub fn receiver_use<F, Fut>(&self, step: F)
    where
        F: Fn(RpcMessage, ReceiverNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.receiver.write().use_fn(step);
    }

    pub fn receiver_use_middleware(
        &self,
        step: impl Middleware<RpcMessage, Result<()>> + 'static,
    ) {
        self.inner.receiver.write().use_middleware(step);
    }

    /// Register a step wrapping the publication of every reply.
    pub fn responder_use<F, Fut>(&self, step: F)
    where
        F: Fn(RpcMessage, ResponderNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.responder.write().use_fn(step);
    }

    pub fn responder_use_middleware(
        &self,
        step: impl Middleware<RpcMessage, Result<()>> + 'static,
    ) {
        self.inner.responder.write().use_middleware(step);
    }
}

impl<C: Codec> Debug for RpcServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.inner.handlers.read();
        let mut operations: Vec<&String> = handlers.keys().collect();
        operations.sort();
        f.debug_struct("RpcServer")
            .field("operations", &operations)
            .finish()
    }
}
