use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::message::types::CorrelationId;

type Slots = DashMap<String, oneshot::Sender<Bytes>>;

/// Pending calls keyed by correlation id.
///
/// Callers register before publishing; the reply consumer resolves. Each
/// slot completes at most once and exactly one caller sees the payload.
#[derive(Debug, Clone, Default)]
pub struct CorrelationRegistry {
    slots: Arc<Slots>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: &CorrelationId) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(correlation_id.as_str().to_string()) {
            Entry::Occupied(_) => {
                Err(RpcError::DuplicateCorrelationId(correlation_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingCall {
                    correlation_id: correlation_id.clone(),
                    rx: Some(rx),
                    slots: self.slots.clone(),
                })
            }
        }
    }

    /// Complete the slot for `correlation_id`. Returns false when no caller
    /// is waiting for it any more.
    pub fn resolve(&self, correlation_id: &str, payload: Bytes) -> bool {
        match self.slots.remove(correlation_id) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.slots.contains_key(correlation_id)
    }

    /// Drop every slot; waiting callers fail with `Cancelled`.
    pub fn clear(&self) {
        let dropped = self.slots.len();
        self.slots.clear();
        if dropped > 0 {
            debug!(dropped, "pending calls cancelled");
        }
    }
}

/// A caller's claim on one registry slot. Dropping it removes the slot, so
/// a reply arriving afterwards is treated as unmatched.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: CorrelationId,
    rx: Option<oneshot::Receiver<Bytes>>,
    slots: Arc<Slots>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub async fn wait(mut self) -> Result<Bytes> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| RpcError::Cancelled(self.correlation_id.to_string()))?;
        rx.await
            .map_err(|_| RpcError::Cancelled(self.correlation_id.to_string()))
    }

    /// Like `wait`, failing with `Timeout` once `timeout` elapses.
    pub async fn wait_timeout(self, timeout: Option<Duration>) -> Result<Bytes> {
        let Some(timeout) = timeout else {
            return self.wait().await;
        };
        let correlation_id = self.correlation_id.to_string();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                correlation_id,
                timeout,
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.slots.remove(self.correlation_id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let pending = registry.register(&id).unwrap();
        assert!(registry.contains(id.as_str()));

        assert!(registry.resolve(id.as_str(), Bytes::from_static(b"42")));
        assert!(!registry.resolve(id.as_str(), Bytes::from_static(b"43")));

        assert_eq!(pending.wait().await.unwrap(), Bytes::from_static(b"42"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_unmatched() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve("nobody", Bytes::new()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from_raw("fixed");
        let _pending = registry.register(&id).unwrap();
        assert!(matches!(
            registry.register(&id),
            Err(RpcError::DuplicateCorrelationId(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_call_frees_slot() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        drop(registry.register(&id).unwrap());

        assert!(registry.is_empty());
        assert!(!registry.resolve(id.as_str(), Bytes::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let pending = registry.register(&id).unwrap();

        let err = pending
            .wait_timeout(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(registry.is_empty());
        assert!(!registry.resolve(id.as_str(), Bytes::new()));
    }

    #[tokio::test]
    async fn test_clear_cancels_waiters() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register(&CorrelationId::new()).unwrap();
        registry.clear();
        assert!(matches!(pending.wait().await, Err(RpcError::Cancelled(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_resolve() {
        let registry = CorrelationRegistry::new();
        let mut waiters = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..500 {
            let id = CorrelationId::new();
            let pending = registry.register(&id).unwrap();
            ids.push(id.clone());
            waiters.push(tokio::spawn(async move {
                let payload = pending.wait().await.unwrap();
                assert_eq!(payload, Bytes::from(id.into_inner()));
            }));
        }

        let mut resolvers = Vec::new();
        for id in ids {
            let registry = registry.clone();
            resolvers.push(tokio::spawn(async move {
                assert!(registry.resolve(id.as_str(), Bytes::from(id.to_string())));
            }));
        }

        for task in resolvers.into_iter().chain(waiters) {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
