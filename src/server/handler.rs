//! Type-erased request handlers
//!
//! A handler takes the raw JSON payload of a call. Deserializing it happens
//! synchronously so a malformed request can be told apart from a handler that
//! ran and failed.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// Handler failures
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The request payload did not match the handler's request type
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Failed(String),
    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

pub type UnaryFuture = BoxFuture<'static, Result<Value, HandlerError>>;
pub type ItemStream = BoxStream<'static, Result<Value, HandlerError>>;

type UnaryFn = dyn Fn(Value) -> Result<UnaryFuture, HandlerError> + Send + Sync;
type StreamFn = dyn Fn(Value) -> Result<ItemStream, HandlerError> + Send + Sync;

/// A registered method implementation
pub enum Handler {
    /// Produces exactly one reply
    Unary(Box<UnaryFn>),
    /// Produces items until it ends, fails or is unsubscribed
    Stream(Box<StreamFn>),
}

fn parse<Req: DeserializeOwned>(message: Value) -> Result<Req, HandlerError> {
    serde_json::from_value(message).map_err(|e| HandlerError::InvalidRequest(e.to_string()))
}

impl Handler {
    /// Wrap a typed async function as a unary handler
    pub fn unary<Req, Resp, F, Fut>(f: F) -> Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        Handler::Unary(Box::new(move |message: Value| -> Result<UnaryFuture, HandlerError> {
            let response = f(parse(message)?);
            Ok(async move {
                let response = response.await?;
                Ok::<Value, HandlerError>(serde_json::to_value(response)?)
            }
            .boxed())
        }))
    }

    /// Wrap a typed stream factory as a streaming handler
    pub fn stream<Req, Item, F, S>(f: F) -> Self
    where
        Req: DeserializeOwned,
        Item: Serialize,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Item, HandlerError>> + Send + 'static,
    {
        Handler::Stream(Box::new(move |message: Value| -> Result<ItemStream, HandlerError> {
            let items = f(parse(message)?);
            Ok(items
                .map(|item| item.and_then(|item| serde_json::to_value(item).map_err(HandlerError::from)))
                .boxed())
        }))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Handler::Stream(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Unary(_) => f.write_str("Handler::Unary"),
            Handler::Stream(_) => f.write_str("Handler::Stream"),
        }
    }
}
