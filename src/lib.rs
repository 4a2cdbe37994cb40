//! mqrpc - request/reply RPC over queue-based message brokers
pub mod client;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod observer;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{CallResult, CallerNext, ReplyNext, RpcClient};
pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use correlation::{CorrelationRegistry, PendingCall};
pub use error::{RemoteError, Result, RpcError, TransportError, TransportResult};
pub use handler::{ExecutionMode, Handler, HandlerFn};
pub use message::operation::OperationName;
pub use message::types::{CorrelationId, RpcArgs, RpcType};
pub use message::{ReplyEnvelope, RpcMessage};
pub use middleware::{FnMiddleware, Middleware, Next, Pipeline};
pub use observer::{MessageEvent, RpcObserver, TracingObserver};
pub use server::{ReceiverNext, ResponderNext, RpcServer};
pub use session::Session;
pub use transport::memory::MemoryBroker;
pub use transport::{Broker, Channel, Connection, Delivery, Properties, QueueOptions, RetryPolicy};

#[cfg(feature = "codec-messagepack")]
pub use codec::MessagePackCodec;

#[cfg(feature = "amqp")]
pub use transport::amqp::AmqpBroker;
