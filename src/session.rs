use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, RpcError, TransportError, TransportResult};
use crate::transport::{Broker, Channel, Connection, DeliveryStream, Properties, QueueOptions};

/// Consumer tasks owned by a session; aborted first on reset.
#[derive(Debug, Default)]
struct ConsumerSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerSet {
    fn push(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

#[derive(Debug)]
struct SessionState {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    consumers: ConsumerSet,
    uri: String,
}

/// One broker connection with a single channel and the consumers running
/// on it.
///
/// `open` acquires connection, channel and consumer set in that order;
/// `reset` releases them in reverse and allows `open` again.
#[derive(Debug)]
pub struct Session {
    broker: Arc<dyn Broker>,
    config: SessionConfig,
    preset_uri: RwLock<Option<String>>,
    state: RwLock<Option<Arc<SessionState>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(broker: impl Broker + 'static, config: SessionConfig) -> Self {
        Self::from_arc(Arc::new(broker), config)
    }

    pub fn from_arc(broker: Arc<dyn Broker>, config: SessionConfig) -> Self {
        Self {
            broker,
            config,
            preset_uri: RwLock::new(None),
            state: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Preset the uri used when `open` is called without one.
    pub fn set_uri(&self, uri: impl Into<String>) {
        *self.preset_uri.write() = Some(uri.into());
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn resolve_uri(&self, uri: Option<&str>) -> Result<String> {
        uri.map(str::to_string)
            .or_else(|| self.preset_uri.read().clone())
            .or_else(|| self.config.uri.clone())
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(RpcError::MissingUri)
    }

    pub async fn open(
        &self,
        uri: Option<&str>,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state.read().is_some() {
            return Err(TransportError::AlreadySetup.into());
        }

        let uri = self.resolve_uri(uri)?;
        let connection = self.connect_with_retry(&uri).await?;

        if !connection.is_open() {
            return Err(TransportError::Setup(
                "connection was closed while creating a channel".into(),
            )
            .into());
        }

        let channel = match connection.open_channel(prefetch_size, prefetch_count).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                let reason = format!("channel could not be opened: {}", e);
                return Err(TransportError::Setup(reason).into());
            }
        };

        if !channel.is_open() {
            let _ = connection.close().await;
            return Err(TransportError::Setup(
                "channel was closed while creating a consumer".into(),
            )
            .into());
        }

        info!(
            broker = self.broker.name(),
            uri = %uri,
            prefetch_size,
            prefetch_count,
            "session opened"
        );

        *self.state.write() = Some(Arc::new(SessionState {
            connection,
            channel,
            consumers: ConsumerSet::default(),
            uri,
        }));
        Ok(())
    }

    async fn connect_with_retry(&self, uri: &str) -> TransportResult<Arc<dyn Connection>> {
        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.broker.connect(uri).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "broker connection failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_policy.delay(attempt)).await;
                    }
                }
            }
        }

        Err(TransportError::ConnectFailed {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Tear down consumers, channel and connection. Safe to call repeatedly.
    pub async fn reset(&self) {
        let _guard = self.lifecycle.lock().await;

        let Some(state) = self.state.write().take() else {
            return;
        };

        state.consumers.abort_all();

        if let Err(e) = state.channel.close().await {
            warn!(error = %e, "failed to close channel");
        }
        if let Err(e) = state.connection.close().await {
            warn!(error = %e, "failed to close connection");
        }

        info!(uri = %state.uri, "session reset");
    }

    pub fn is_open(&self) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|state| state.connection.is_open() && state.channel.is_open())
    }

    fn state(&self) -> TransportResult<Arc<SessionState>> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| TransportError::Unavailable("session is not set up".into()))
    }

    /// The open channel, or `Unavailable` if the session is down.
    pub fn channel(&self) -> TransportResult<Arc<dyn Channel>> {
        let state = self.state()?;
        if !state.channel.is_open() {
            return Err(TransportError::Unavailable("channel is closed".into()));
        }
        Ok(state.channel.clone())
    }

    pub async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> TransportResult<String> {
        self.channel()?.declare_queue(name, options).await
    }

    /// Publish to the default exchange, routed by queue name.
    pub async fn publish(
        &self,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> TransportResult<()> {
        self.channel()?
            .publish("", routing_key, properties, body)
            .await
    }

    pub async fn consume(&self, queue: &str, auto_ack: bool) -> TransportResult<DeliveryStream> {
        self.channel()?.consume(queue, auto_ack).await
    }

    /// Run a consumer loop that lives until the session is reset.
    pub fn spawn_consumer<F>(&self, consumer: F) -> TransportResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state()?;
        state.consumers.push(tokio::spawn(consumer));
        Ok(())
    }

    pub fn consumer_count(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|state| state.consumers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RetryPolicy;
    use crate::transport::memory::{DEFAULT_URI, MemoryBroker};
    use std::time::Duration;

    fn session(broker: &MemoryBroker) -> Session {
        Session::new(broker.clone(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_open_and_reset() {
        let broker = MemoryBroker::new();
        let session = session(&broker);

        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();
        assert!(session.is_open());
        assert_eq!(broker.open_connections(), 1);

        session.reset().await;
        assert!(!session.is_open());
        assert_eq!(broker.open_connections(), 0);

        session.reset().await;
        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let broker = MemoryBroker::new();
        let session = session(&broker);

        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();
        let err = session.open(Some(DEFAULT_URI), 0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Transport(TransportError::AlreadySetup)
        ));
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_uri_resolution() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        assert!(matches!(
            session.open(None, 0, 1).await,
            Err(RpcError::MissingUri)
        ));

        session.set_uri(DEFAULT_URI);
        session.open(None, 0, 1).await.unwrap();

        let configured = Session::new(broker.clone(), SessionConfig::new().with_uri(DEFAULT_URI));
        configured.open(None, 0, 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_linear_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let session = session(&broker);

        let started = tokio::time::Instant::now();
        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        // 5s after the first failure, 10s after the second
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);
        let session = Session::new(
            broker.clone(),
            SessionConfig::new().with_retry_policy(RetryPolicy::Fixed { delay_ms: 10 }),
        );

        let err = session.open(Some(DEFAULT_URI), 0, 1).await.unwrap_err();
        match err {
            RpcError::Transport(TransportError::ConnectFailed { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(broker.connect_attempts(), 3);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_channel_failure_is_setup_error_and_releases_connection() {
        let broker = MemoryBroker::new();
        broker.fail_next_channel_opens(1);
        let session = session(&broker);

        let err = session.open(Some(DEFAULT_URI), 0, 1).await.unwrap_err();
        match err {
            RpcError::Transport(TransportError::Setup(message)) => {
                assert!(message.contains("channel"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(broker.open_connections(), 0);
        assert!(!session.is_open());

        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_unavailable_when_not_set_up_or_closed() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        assert!(matches!(
            session.channel(),
            Err(TransportError::Unavailable(_))
        ));

        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();
        broker.disconnect_all();
        assert!(matches!(
            session.channel(),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_aborts_consumers() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.open(Some(DEFAULT_URI), 0, 1).await.unwrap();

        session.spawn_consumer(futures::future::pending()).unwrap();
        assert_eq!(session.consumer_count(), 1);

        session.reset().await;
        assert_eq!(session.consumer_count(), 0);
        assert!(session.spawn_consumer(async {}).is_err());
    }
}
