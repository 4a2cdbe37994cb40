use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ClientConfig;
use crate::correlation::CorrelationRegistry;
use crate::error::{Result, RpcError, TransportError};
use crate::message::operation::OperationName;
use crate::message::types::{RpcArgs, RpcType};
use crate::message::{ReplyEnvelope, RpcMessage};
use crate::middleware::{Middleware, Next, Pipeline};
use crate::observer::{RpcObserver, TracingObserver};
use crate::session::Session;
use crate::transport::{Broker, DeliveryStream, QueueOptions};

/// Result of the caller pipeline: the raw reply payload.
pub type CallResult = Result<Bytes>;
pub type CallerNext = Next<RpcMessage, CallResult>;
pub type ReplyNext = Next<RpcMessage, Result<()>>;

struct ClientInner<C: Codec> {
    session: Session,
    codec: C,
    config: ClientConfig,
    registry: CorrelationRegistry,
    observer: RwLock<Arc<dyn RpcObserver>>,
    caller: RwLock<Pipeline<RpcMessage, CallResult>>,
    reply_receiver: RwLock<Pipeline<RpcMessage, Result<()>>>,
    reply_queue: RwLock<Option<String>>,
    runtime: RwLock<Option<Handle>>,
}

impl<C: Codec> ClientInner<C> {
    fn observer(&self) -> Arc<dyn RpcObserver> {
        self.observer.read().clone()
    }

    /// Terminal step of the caller pipeline. The pending call is registered
    /// before the request is published.
    async fn send_and_wait(&self, message: RpcMessage) -> CallResult {
        let pending = self.registry.register(message.correlation_id())?;
        self.observer().message_sent(&message.event());

        let payload = message.payload.clone();
        self.session
            .publish(&message.queue, message.properties(), payload)
            .await?;

        pending.wait_timeout(self.config.call_timeout).await
    }
}

/// Client side of request/reply RPC over a broker.
///
/// Calls are published to the queue named after the operation and matched
/// to replies on a private reply queue by correlation id. Cloning yields
/// another handle to the same client.
pub struct RpcClient<C: Codec = JsonCodec> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Codec> Clone for RpcClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RpcClient<JsonCodec> {
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::with_config(broker, ClientConfig::default())
    }

    pub fn with_config(broker: impl Broker + 'static, config: ClientConfig) -> Self {
        Self::with_codec_and_config(broker, JsonCodec, config)
    }
}

impl<C: Codec> RpcClient<C> {
    pub fn with_codec(broker: impl Broker + 'static, codec: C) -> Self {
        Self::with_codec_and_config(broker, codec, ClientConfig::default())
    }

    pub fn with_codec_and_config(
        broker: impl Broker + 'static,
        codec: C,
        config: ClientConfig,
    ) -> Self {
        let session = Session::new(broker, config.session.clone());
        Self {
            inner: Arc::new(ClientInner {
                session,
                codec,
                config,
                registry: CorrelationRegistry::new(),
                observer: RwLock::new(Arc::new(TracingObserver)),
                caller: RwLock::new(Pipeline::new()),
                reply_receiver: RwLock::new(Pipeline::new()),
                reply_queue: RwLock::new(None),
                runtime: RwLock::new(None),
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

    /// Preset the broker uri used by `setup(None)`.
    pub fn set_uri(&self, uri: impl Into<String>) {
        self.inner.session.set_uri(uri);
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Name of the private reply queue, once set up.
    pub fn reply_queue(&self) -> Result<String> {
        self.inner
            .reply_queue
            .read()
            .clone()
            .ok_or_else(|| TransportError::Unavailable("client is not set up".into()).into())
    }

    /// Connect, declare the reply queue and start consuming replies.
    pub async fn setup(&self, uri: Option<&str>) -> Result<()> {
        self.inner.session.open(uri, 0, 1).await?;

        if let Err(e) = self.attach_reply_consumer().await {
            self.inner.session.reset().await;
            return Err(e);
        }

        *self.inner.runtime.write() = Some(Handle::current());
        Ok(())
    }

    async fn attach_reply_consumer(&self) -> Result<()> {
        let session = &self.inner.session;
        let queue = session
            .declare_queue("", &QueueOptions::reply_queue())
            .await?;
        let deliveries = session.consume(&queue, true).await?;
        session.spawn_consumer(consume_replies(Arc::downgrade(&self.inner), deliveries))?;

        info!(reply_queue = %queue, "rpc client ready");
        *self.inner.reply_queue.write() = Some(queue);
        Ok(())
    }

    /// Tear the client down. Calls still waiting fail with `Cancelled`.
    pub async fn reset(&self) {
        self.inner.session.reset().await;
        self.inner.reply_queue.write().take();
        self.inner.runtime.write().take();
        self.inner.registry.clear();
    }

    /// Register a caller-side step wrapping every subsequent call.
    pub fn caller_use<F, Fut>(&self, step: F)
    where
        F: Fn(RpcMessage, CallerNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.inner.caller.write().use_fn(step);
    }

    pub fn caller_use_middleware(&self, step: impl Middleware<RpcMessage, CallResult> + 'static) {
        self.inner.caller.write().use_middleware(step);
    }

    /// Register a step wrapping the matching of every inbound reply.
    pub fn reply_receiver_use<F, Fut>(&self, step: F)
    where
        F: Fn(RpcMessage, ReplyNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.reply_receiver.write().use_fn(step);
    }

    pub fn reply_receiver_use_middleware(
        &self,
        step: impl Middleware<RpcMessage, Result<()>> + 'static,
    ) {
        self.inner.reply_receiver.write().use_middleware(step);
    }

    /// Call `alias` with `args` and wait for its result.
    ///
    /// The target queue is the operation name derived from `alias`, the
    /// argument types and `R`, so overloads reach distinct handlers.
    pub async fn call_async<R, A>(&self, alias: &str, args: A) -> Result<R>
    where
        R: RpcType,
        A: RpcArgs,
    {
        let operation = OperationName::of::<A, R>(alias)?;
        let reply_to = self.reply_queue()?;
        let payload = Bytes::from(self.inner.codec.encode(&args.into_values()?)?);
        let message = RpcMessage::call(operation.as_str(), reply_to, payload);

        let pipeline = self.inner.caller.read().clone();
        let inner = self.inner.clone();
        let reply = pipeline
            .run(message, move |message| async move {
                inner.send_and_wait(message).await
            })
            .await?;

        ReplyEnvelope::decode_result::<C, R>(&self.inner.codec, operation.as_str(), &reply)
    }

    pub async fn call_void_async<A: RpcArgs>(&self, alias: &str, args: A) -> Result<()> {
        self.call_async::<(), A>(alias, args).await
    }

    /// Blocking form of [`call_async`](Self::call_async).
    ///
    /// Usable from plain threads and from multi-threaded runtimes. Inside a
    /// current-thread runtime it fails with `BlockingCall`, since blocking
    /// that thread would starve the reply consumer.
    pub fn call<R, A>(&self, alias: &str, args: A) -> Result<R>
    where
        R: RpcType,
        A: RpcArgs,
    {
        let handle = self
            .inner
            .runtime
            .read()
            .clone()
            .ok_or_else(|| TransportError::Unavailable("client is not set up".into()))?;

        match Handle::try_current() {
            Ok(current) => match current.runtime_flavor() {
                RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| {
                    handle.block_on(self.call_async::<R, A>(alias, args))
                }),
                _ => Err(RpcError::BlockingCall(
                    "call would block a current-thread runtime, use call_async".into(),
                )),
            },
            Err(_) => handle.block_on(self.call_async::<R, A>(alias, args)),
        }
    }

    pub fn call_void<A: RpcArgs>(&self, alias: &str, args: A) -> Result<()> {
        self.call::<(), A>(alias, args)
    }
}

impl<C: Codec> std::fmt::Debug for RpcClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_queue", &*self.inner.reply_queue.read())
            .field("pending_calls", &self.inner.registry.len())
            .finish()
    }
}

async fn consume_replies<C: Codec>(inner: Weak<ClientInner<C>>, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let message = match RpcMessage::from_delivery(delivery) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed reply");
                continue;
            }
        };
        inner.observer().reply_received(&message.event());

        let registry = inner.registry.clone();
        let pipeline = inner.reply_receiver.read().clone();
        let result = pipeline
            .run(message, move |message| async move {
                let correlation_id = message.correlation_id().to_string();
                if !registry.resolve(&correlation_id, message.payload) {
                    debug!(correlation_id = %correlation_id, "unmatched reply dropped");
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            warn!(error = %e, "reply receiver pipeline failed");
        }
    }
    debug!("reply consumer stopped");
}
