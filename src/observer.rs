use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Snapshot of a message at one of the observation points.
#[derive(Debug, Clone, Copy)]
pub struct MessageEvent<'a> {
    pub correlation_id: &'a str,
    pub queue: &'a str,
    pub reply_to: &'a str,
    pub payload: &'a [u8],
}

impl MessageEvent<'_> {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.payload)
    }
}

/// Observation hooks injected into the client and server at construction.
///
/// All methods default to no-ops. Implementations run inline on the
/// publishing or consuming task and should return quickly.
pub trait RpcObserver: Send + Sync + Debug {
    /// Client, before the request is published.
    fn message_sent(&self, _event: &MessageEvent<'_>) {}

    /// Client, after a reply was decoded and before it is matched.
    fn reply_received(&self, _event: &MessageEvent<'_>) {}

    /// Server, after a request was decoded and before dispatch.
    fn message_received(&self, _event: &MessageEvent<'_>) {}

    /// Server, after the reply was published.
    fn responded(&self, _event: &MessageEvent<'_>) {}
}

/// Emits every observation as a `tracing` debug event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RpcObserver for TracingObserver {
    fn message_sent(&self, event: &MessageEvent<'_>) {
        debug!(
            correlation_id = event.correlation_id,
            queue = event.queue,
            reply_to = event.reply_to,
            payload = %event.payload_str(),
            "message sent"
        );
    }

    fn reply_received(&self, event: &MessageEvent<'_>) {
        debug!(
            correlation_id = event.correlation_id,
            queue = event.queue,
            payload = %event.payload_str(),
            "reply received"
        );
    }

    fn message_received(&self, event: &MessageEvent<'_>) {
        debug!(
            correlation_id = event.correlation_id,
            queue = event.queue,
            reply_to = event.reply_to,
            payload = %event.payload_str(),
            "message received"
        );
    }

    fn responded(&self, event: &MessageEvent<'_>) {
        debug!(
            correlation_id = event.correlation_id,
            queue = event.queue,
            payload = %event.payload_str(),
            "responded"
        );
    }
}

impl<T: RpcObserver + ?Sized> RpcObserver for Arc<T> {
    fn message_sent(&self, event: &MessageEvent<'_>) {
        (**self).message_sent(event)
    }

    fn reply_received(&self, event: &MessageEvent<'_>) {
        (**self).reply_received(event)
    }

    fn message_received(&self, event: &MessageEvent<'_>) {
        (**self).message_received(event)
    }

    fn responded(&self, event: &MessageEvent<'_>) {
        (**self).responded(event)
    }
}
