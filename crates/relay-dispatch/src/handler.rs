//! Handler trait for method invocations.

use std::future::Future;

use async_trait::async_trait;
use relay_core::{Request, SessionId};
use serde_json::Value;
use thiserror::Error;

/// A request routed to a handler, with the session it belongs to.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub session_id: SessionId,
    pub request: Request,
}

impl Invocation {
    #[must_use]
    pub const fn new(session_id: SessionId, request: Request) -> Self {
        Self {
            session_id,
            request,
        }
    }

    /// Request parameters.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.request.params
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    /// Value delivered to the client in the result event.
    pub value: Value,
    /// Artifact bytes to record as a report, if any.
    pub artifact: Option<Vec<u8>>,
}

impl HandlerOutput {
    /// Plain result without an artifact.
    #[must_use]
    pub const fn value(value: Value) -> Self {
        Self {
            value,
            artifact: None,
        }
    }

    /// Attach an artifact to be stored as a report.
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<Vec<u8>>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
    pub detail: Option<Value>,
}

impl HandlerFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Trait implemented by external collaborators that do the work for a method.
///
/// Handlers are registered once at startup. The registry validates
/// parameters before calling `call` and enforces the execution budget, so
/// implementations can assume well-formed input.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Perform the work for one request.
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure>;
}

/// Handler backed by an async closure.
#[derive(Debug, Clone)]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerFailure>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerFailure>> + Send,
{
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        (self.0)(invocation).await
    }
}
