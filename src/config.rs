use std::time::Duration;

use crate::transport::RetryPolicy;

pub const BROKER_URI_ENV: &str = "MQRPC_BROKER_URI";
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 3;
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Long enough for an idle queue to survive a weekend.
pub const DEFAULT_QUEUE_EXPIRY: Duration = Duration::from_secs(36 * 60 * 60);

/// Configuration for a transport session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub uri: Option<String>,
    pub max_connect_attempts: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            max_connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the broker uri taken from `MQRPC_BROKER_URI` if set.
    pub fn from_env() -> Self {
        let uri = std::env::var(BROKER_URI_ENV)
            .ok()
            .filter(|uri| !uri.trim().is_empty());
        Self {
            uri,
            ..Self::default()
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_max_connect_attempts(mut self, attempts: usize) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub session: SessionConfig,
    /// Deadline for a single call; `None` waits for the reply forever.
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn without_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub session: SessionConfig,
    /// Idle time after which the broker drops an operation queue.
    pub queue_expiry: Duration,
    /// Unacknowledged requests in flight per subscription. Async handlers
    /// only run concurrently when this is above one.
    pub prefetch_count: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            queue_expiry: DEFAULT_QUEUE_EXPIRY,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_queue_expiry(mut self, expiry: Duration) -> Self {
        self.queue_expiry = expiry;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count.max(1);
        self
    }
}
