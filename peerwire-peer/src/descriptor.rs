//! Call and message descriptors.

use crate::error::HandlerError;
use bytes::Bytes;
use peerwire_protocol::{Type, Value, Writer};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a call handler.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// Answers an inbound call. Receives [`Value::Null`] when the call has no input.
pub type CallHandler = Arc<dyn Fn(Value) -> CallFuture + Send + Sync>;

/// Future returned by a message handler.
pub type MessageFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Consumes an inbound message.
pub type MessageHandler = Arc<dyn Fn(Value) -> MessageFuture + Send + Sync>;

/// Wraps an async function as a [`CallHandler`].
pub fn call_handler<F, Fut>(f: F) -> CallHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Wraps an async function as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// A request/response operation.
#[derive(Clone)]
pub struct Call {
    id: u64,
    name: String,
    input: Option<Type>,
    output: Option<Type>,
    handler: Option<CallHandler>,
    hash: Bytes,
}

impl Call {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        output: Option<Type>,
        handler: Option<CallHandler>,
    ) -> Self {
        let hash = call_hash(input.as_ref(), output.as_ref());
        Self {
            id,
            name: name.into(),
            input,
            output,
            handler,
            hash,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> Option<&Type> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Type> {
        self.output.as_ref()
    }

    pub fn handler(&self) -> Option<&CallHandler> {
        self.handler.as_ref()
    }

    /// `0x00 [input hash] 0x01 [output hash]`
    pub fn hash(&self) -> &Bytes {
        &self.hash
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("input", &self.input.as_ref().map(Type::describe))
            .field("output", &self.output.as_ref().map(Type::describe))
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

fn call_hash(input: Option<&Type>, output: Option<&Type>) -> Bytes {
    let mut w = Writer::new();
    w.put_u8(0x00);
    if let Some(ty) = input {
        w.put_slice(&ty.hash());
    }
    w.put_u8(0x01);
    if let Some(ty) = output {
        w.put_slice(&ty.hash());
    }
    w.into_bytes()
}

/// A one-way notification.
#[derive(Clone)]
pub struct Message {
    id: u64,
    name: String,
    input: Option<Type>,
    handler: Option<MessageHandler>,
    hash: Bytes,
}

impl Message {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        handler: Option<MessageHandler>,
    ) -> Self {
        let hash = input.as_ref().map(Type::hash).unwrap_or_default();
        Self {
            id,
            name: name.into(),
            input,
            handler,
            hash,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> Option<&Type> {
        self.input.as_ref()
    }

    pub fn handler(&self) -> Option<&MessageHandler> {
        self.handler.as_ref()
    }

    /// The input type's hash, or empty when there is no input.
    pub fn hash(&self) -> &Bytes {
        &self.hash
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("input", &self.input.as_ref().map(Type::describe))
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
