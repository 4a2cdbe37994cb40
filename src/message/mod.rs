pub mod operation;
pub mod types;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;

use self::types::{CorrelationId, RpcType};
use crate::codec::Codec;
use crate::error::{RemoteError, Result, RpcError};
use crate::observer::MessageEvent;
use crate::transport::{Delivery, Properties};

/// Unit of work flowing through the middleware pipelines on both sides.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    correlation_id: CorrelationId,
    pub payload: Bytes,
    pub reply_to: String,
    pub queue: String,
    /// Broker-assigned, zero on outbound messages.
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl RpcMessage {
    /// Outbound request with a freshly generated correlation id.
    pub fn call(queue: impl Into<String>, reply_to: impl Into<String>, payload: Bytes) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            payload,
            reply_to: reply_to.into(),
            queue: queue.into(),
            delivery_tag: 0,
            redelivered: false,
        }
    }

    /// Reply addressed to the request's reply-to queue, carrying its correlation id.
    pub fn reply(request: &RpcMessage, payload: Bytes) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            payload,
            reply_to: String::new(),
            queue: request.reply_to.clone(),
            delivery_tag: 0,
            redelivered: false,
        }
    }

    pub fn from_delivery(delivery: Delivery) -> Result<Self> {
        let Some(correlation_id) = delivery.properties.correlation_id else {
            let reason = format!(
                "delivery {} on {} has no correlation id",
                delivery.delivery_tag, delivery.routing_key
            );
            return Err(RpcError::InvalidMessage(reason));
        };

        Ok(Self {
            correlation_id: CorrelationId::from_raw(correlation_id),
            payload: delivery.body,
            reply_to: delivery.properties.reply_to.unwrap_or_default(),
            queue: delivery.routing_key,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        })
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn properties(&self) -> Properties {
        Properties {
            correlation_id: Some(self.correlation_id.as_str().to_string()),
            reply_to: (!self.reply_to.is_empty()).then(|| self.reply_to.clone()),
        }
    }

    pub fn event(&self) -> MessageEvent<'_> {
        MessageEvent {
            correlation_id: self.correlation_id.as_str(),
            queue: &self.queue,
            reply_to: &self.reply_to,
            payload: &self.payload,
        }
    }
}

/// Wire form of a reply: either the handler's value or its failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyEnvelope {
    Ok(Value),
    Err(RemoteError),
}

impl ReplyEnvelope {
    pub fn encode<C: Codec>(&self, codec: &C) -> Result<Bytes> {
        Ok(Bytes::from(codec.encode(self)?))
    }

    /// Decode a reply payload into the caller's expected result type.
    pub fn decode_result<C: Codec, R: RpcType>(
        codec: &C,
        operation: &str,
        payload: &[u8],
    ) -> Result<R> {
        let envelope: ReplyEnvelope = match codec.decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => return Err(result_error(operation, e)),
        };

        match envelope {
            ReplyEnvelope::Ok(value) => {
                serde_json::from_value(value).map_err(|e| result_error(operation, e))
            }
            ReplyEnvelope::Err(remote) => Err(RpcError::Remote(remote)),
        }
    }
}

fn result_error(operation: &str, reason: impl Display) -> RpcError {
    RpcError::ResultDeserialization {
        operation: operation.to_string(),
        reason: reason.to_string(),
    }
}
