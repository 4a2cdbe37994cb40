use serde_json::Value;
use std::any::Any;
use std::fmt::{Debug, Display};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use crate::codec::Codec;
use crate::error::RemoteError;
use crate::message::ReplyEnvelope;
use crate::message::operation::OperationName;
use crate::message::types::{RpcArgs, RpcType};

/// How a subscription runs its handler relative to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One delivery at a time, handled on the consumer task.
    #[default]
    Sync,
    /// Each delivery is handled on its own task; replies may complete out
    /// of order.
    Async,
}

/// A plain function usable as an operation handler, taking its arguments
/// as the tuple `Args`.
pub trait HandlerFn<Args>: Send + Sync + 'static {
    type Output;

    fn call(&self, args: Args) -> Self::Output;
}

macro_rules! impl_handler_fn {
    ($($ty:ident),*) => {
        impl<Func, Out, $($ty),*> HandlerFn<($($ty,)*)> for Func
        where
            Func: Fn($($ty),*) -> Out + Send + Sync + 'static,
        {
            type Output = Out;

            #[allow(non_snake_case)]
            fn call(&self, args: ($($ty,)*)) -> Out {
                let ($($ty,)*) = args;
                (self)($($ty),*)
            }
        }
    };
}

impl_handler_fn!();
impl_handler_fn!(A);
impl_handler_fn!(A, B);
impl_handler_fn!(A, B, C);
impl_handler_fn!(A, B, C, D);
impl_handler_fn!(A, B, C, D, E);
impl_handler_fn!(A, B, C, D, E, F);

pub type Outcome = std::result::Result<Value, RemoteError>;

/// Uniform capability behind every subscription: serialized arguments in,
/// reply envelope out. Never fails; every problem becomes an error reply.
pub trait Handler: Send + Sync {
    fn invoke(&self, payload: &[u8]) -> ReplyEnvelope;

    fn operation(&self) -> &OperationName;
}

pub struct TypedHandler<C, A, F> {
    operation: OperationName,
    codec: C,
    func: F,
    _phantom: PhantomData<fn(A)>,
}

impl<C, A, F> TypedHandler<C, A, F>
where
    C: Codec,
    A: RpcArgs,
    F: Fn(A) -> Outcome + Send + Sync + 'static,
{
    pub fn new(operation: OperationName, codec: C, func: F) -> Self {
        Self {
            operation,
            codec,
            func,
            _phantom: PhantomData,
        }
    }

    fn decode_args(&self, payload: &[u8]) -> crate::error::Result<A> {
        let values: Vec<Value> = self.codec.decode(payload)?;
        A::from_values(values)
    }
}

impl<C, A, F> Handler for TypedHandler<C, A, F>
where
    C: Codec,
    A: RpcArgs,
    F: Fn(A) -> Outcome + Send + Sync + 'static,
{
    fn invoke(&self, payload: &[u8]) -> ReplyEnvelope {
        let operation = self.operation.as_str();
        let args = match self.decode_args(payload) {
            Ok(args) => args,
            Err(e) => {
                return ReplyEnvelope::Err(RemoteError::new(
                    operation,
                    format!("invalid arguments: {}", e),
                ));
            }
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.func)(args))) {
            Ok(Ok(value)) => ReplyEnvelope::Ok(value),
            Ok(Err(remote)) => ReplyEnvelope::Err(remote),
            Err(panic) => {
                let remote = RemoteError::new(operation, panic_message(panic.as_ref()));
                ReplyEnvelope::Err(remote.with_detail("handler panicked"))
            }
        }
    }

    fn operation(&self) -> &OperationName {
        &self.operation
    }
}

impl<C, A, F> Debug for TypedHandler<C, A, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedHandler")
            .field("operation", &self.operation)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn encode_value<R: RpcType>(operation: &str, value: R) -> Outcome {
    serde_json::to_value(value).map_err(|e| {
        let message = format!("result could not be serialized: {}", e);
        RemoteError::new(operation, message)
    })
}

/// Adapt a handler whose return value is the operation's result.
pub fn returning<A, R, H>(
    operation: &OperationName,
    handler: H,
) -> impl Fn(A) -> Outcome + Send + Sync + 'static
where
    A: RpcArgs,
    R: RpcType,
    H: HandlerFn<A, Output = R>,
{
    let operation = operation.to_string();
    move |args| encode_value(&operation, handler.call(args))
}

/// Adapt a handler returning `Result<R, E>`; `Err` travels back to the
/// caller as a remote error carrying its `Display` and `Debug` output.
pub fn fallible<A, R, E, H>(
    operation: &OperationName,
    handler: H,
) -> impl Fn(A) -> Outcome + Send + Sync + 'static
where
    A: RpcArgs,
    R: RpcType,
    E: Display + Debug,
    H: HandlerFn<A, Output = std::result::Result<R, E>>,
{
    let operation = operation.to_string();
    move |args| match handler.call(args) {
        Ok(value) => encode_value(&operation, value),
        Err(e) => {
            let remote = RemoteError::new(&operation, e.to_string());
            Err(remote.with_detail(format!("{:?}", e)))
        }
    }
}
