//! Method registry and handler invocation.
//!
//! The registry is assembled once at startup through `RegistryBuilder` and
//! is immutable afterwards, so lookups need no locking. `Registry::invoke`
//! is the error boundary between the relay and handler code: schema
//! failures never reach the handler, panics and handler errors become
//! structured `DispatchError`s, and handlers that overrun their budget are
//! aborted.

use std::{collections::HashMap, sync::Arc, time::Duration};

use relay_core::{Coded, ErrorCode};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    handler::{Handler, HandlerOutput, Invocation},
    schema::{ParamSchema, SchemaError},
};

/// Registration error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Method already registered: {0}")]
    DuplicateMethod(String),
    #[error("Method {method}: {source}")]
    InvalidSchema {
        method: String,
        #[source]
        source: SchemaError,
    },
}

impl Coded for RegistryError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateMethod(_) => ErrorCode::DuplicateMethod,
            Self::InvalidSchema { .. } => ErrorCode::InvalidParams,
        }
    }
}

/// Dispatch error.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Invalid params for {method}: {}", errors.join("; "))]
    InvalidParams { method: String, errors: Vec<String> },
    #[error("Handler for {method} failed: {message}")]
    Handler {
        method: String,
        message: String,
        detail: Option<Value>,
    },
    #[error("Handler for {method} exceeded its {}ms budget", budget.as_millis())]
    Timeout { method: String, budget: Duration },
}

impl Coded for DispatchError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::Handler { .. } => ErrorCode::HandlerError,
            Self::Timeout { .. } => ErrorCode::HandlerTimeout,
        }
    }

    fn detail(&self) -> Option<Value> {
        match self {
            Self::InvalidParams { errors, .. } => Some(json!({ "errors": errors })),
            Self::Handler { detail, .. } => detail.clone(),
            Self::Timeout { budget, .. } => Some(json!({
                "budget_ms": u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)
            })),
            Self::UnknownMethod(_) => None,
        }
    }
}

/// A registered method: name, parameter schema and handler.
pub struct Capability {
    method: String,
    description: Option<String>,
    schema: ParamSchema,
    handler: Arc<dyn Handler>,
    timeout: Option<Duration>,
}

impl Capability {
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub const fn schema(&self) -> &ParamSchema {
        &self.schema
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Listing entry describing a registered method.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params_schema: Value,
}

/// Options for a registration beyond name, schema and handler.
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    pub description: Option<String>,
    /// Execution budget overriding the registry default.
    pub timeout: Option<Duration>,
}

/// Builder used during startup.
pub struct RegistryBuilder {
    methods: HashMap<String, Capability>,
    default_timeout: Duration,
}

impl RegistryBuilder {
    /// Create a builder whose handlers default to `default_timeout`.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            methods: HashMap::new(),
            default_timeout,
        }
    }

    /// Register a handler under `method` with a compiled schema.
    ///
    /// # Errors
    /// Returns `DuplicateMethod` if the name is already bound.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        schema: ParamSchema,
        handler: impl Handler + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.register_with(method, schema, handler, MethodOptions::default())
    }

    /// Register with a JSON Schema document, compiling it first.
    ///
    /// # Errors
    /// Returns `InvalidSchema` or `DuplicateMethod`.
    pub fn register_json(
        &mut self,
        method: impl Into<String>,
        schema: Value,
        handler: impl Handler + 'static,
        options: MethodOptions,
    ) -> Result<&mut Self, RegistryError> {
        let method = method.into();
        let schema = ParamSchema::new(schema).map_err(|source| RegistryError::InvalidSchema {
            method: method.clone(),
            source,
        })?;
        self.register_with(method, schema, handler, options)
    }

    /// Register with explicit options.
    ///
    /// # Errors
    /// Returns `DuplicateMethod` if the name is already bound.
    pub fn register_with(
        &mut self,
        method: impl Into<String>,
        schema: ParamSchema,
        handler: impl Handler + 'static,
        options: MethodOptions,
    ) -> Result<&mut Self, RegistryError> {
        let method = method.into();
        if self.methods.contains_key(&method) {
            return Err(RegistryError::DuplicateMethod(method));
        }
        debug!(%method, "Registered method");
        self.methods.insert(
            method.clone(),
            Capability {
                method,
                description: options.description,
                schema,
                handler: Arc::new(handler),
                timeout: options.timeout,
            },
        );
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> Registry {
        Registry {
            methods: self.methods,
            default_timeout: self.default_timeout,
        }
    }
}

/// Immutable method registry.
pub struct Registry {
    methods: HashMap<String, Capability>,
    default_timeout: Duration,
}

impl Registry {
    /// Start building a registry.
    #[must_use]
    pub fn builder(default_timeout: Duration) -> RegistryBuilder {
        RegistryBuilder::new(default_timeout)
    }

    /// Look up the capability bound to `method`.
    ///
    /// # Errors
    /// Returns `UnknownMethod` if nothing is registered under the name.
    pub fn resolve(&self, method: &str) -> Result<&Capability, DispatchError> {
        self.methods
            .get(method)
            .ok_or_else(|| DispatchError::UnknownMethod(method.to_string()))
    }

    /// Registered methods, sorted by name.
    #[must_use]
    pub fn capabilities(&self) -> Vec<CapabilityInfo> {
        let mut list: Vec<CapabilityInfo> = self
            .methods
            .values()
            .map(|c| CapabilityInfo {
                method: c.method.clone(),
                description: c.description.clone(),
                params_schema: c.schema.as_json().clone(),
            })
            .collect();
        list.sort_by(|a, b| a.method.cmp(&b.method));
        list
    }

    /// Validate and run a handler within its execution budget.
    ///
    /// The handler runs on its own task, so it finishes even if the caller
    /// stops waiting for it for reasons other than the budget.
    ///
    /// # Errors
    /// `InvalidParams` without calling the handler on schema failure,
    /// `Timeout` if the budget elapses, `Handler` for handler failures and
    /// panics.
    pub async fn invoke(
        &self,
        capability: &Capability,
        invocation: Invocation,
    ) -> Result<HandlerOutput, DispatchError> {
        let method = capability.method.clone();
        capability
            .schema
            .validate(invocation.params())
            .map_err(|errors| DispatchError::InvalidParams {
                method: method.clone(),
                errors,
            })?;

        let budget = capability.timeout.unwrap_or(self.default_timeout);
        let handler = Arc::clone(&capability.handler);
        let mut task = tokio::spawn(async move { handler.call(invocation).await });

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(failure))) => Err(DispatchError::Handler {
                method,
                message: failure.message,
                detail: failure.detail,
            }),
            Ok(Err(join_err)) => {
                warn!(%method, "Handler task failed: {join_err}");
                Err(DispatchError::Handler {
                    method,
                    message: if join_err.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        "handler cancelled".to_string()
                    },
                    detail: None,
                })
            }
            Err(_) => {
                task.abort();
                warn!(%method, budget_ms = budget.as_millis(), "Handler timed out");
                Err(DispatchError::Timeout { method, budget })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_core::Request;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::handler::{HandlerFailure, handler_fn};

    async fn explode(_inv: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        panic!("handler bug")
    }

    fn invocation(method: &str, params: Value) -> Invocation {
        Invocation::new(Uuid::new_v4(), Request::new("1", method, params))
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let mut builder = Registry::builder(Duration::from_secs(1));
        builder
            .register("echo", ParamSchema::any(), crate::builtin::EchoHandler)
            .unwrap();
        let err = builder
            .register("echo", ParamSchema::any(), crate::builtin::EchoHandler)
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateMethod(ref m) if m == "echo"));
        assert_eq!(err.code(), ErrorCode::DuplicateMethod);
    }

    #[test]
    fn test_unknown_method() {
        let registry = Registry::builder(Duration::from_secs(1)).build();
        let err = registry.resolve("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn test_invalid_params_never_reach_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut builder = Registry::builder(Duration::from_secs(1));
        builder
            .register_json(
                "greet",
                json!({"type": "object", "required": ["name"]}),
                handler_fn(move |_inv| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HandlerFailure>(HandlerOutput::value(json!("hi")))
                    }
                }),
                MethodOptions::default(),
            )
            .unwrap();
        let registry = builder.build();

        let cap = registry.resolve("greet").unwrap();
        let err = registry
            .invoke(cap, invocation("greet", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry
            .invoke(cap, invocation("greet", json!({"name": "x"})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_and_panic_are_contained() {
        let mut builder = Registry::builder(Duration::from_secs(1));
        builder
            .register(
                "fail",
                ParamSchema::any(),
                handler_fn(|_inv| async {
                    Err::<HandlerOutput, _>(
                        HandlerFailure::new("boom").with_detail(json!({"why": "test"})),
                    )
                }),
            )
            .unwrap()
            .register(
                "panic",
                ParamSchema::any(),
                handler_fn(explode),
            )
            .unwrap();
        let registry = builder.build();

        let err = registry
            .invoke(registry.resolve("fail").unwrap(), invocation("fail", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerError);
        assert_eq!(err.detail(), Some(json!({"why": "test"})));

        let err = registry
            .invoke(registry.resolve("panic").unwrap(), invocation("panic", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded_is_timeout() {
        let mut builder = Registry::builder(Duration::from_secs(60));
        builder
            .register_with(
                "slow",
                ParamSchema::any(),
                handler_fn(|_inv| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, HandlerFailure>(HandlerOutput::value(json!("late")))
                }),
                MethodOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..MethodOptions::default()
                },
            )
            .unwrap();
        let registry = builder.build();

        let err = registry
            .invoke(registry.resolve("slow").unwrap(), invocation("slow", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { budget, .. } if budget == Duration::from_millis(50)));
        assert_eq!(err.code(), ErrorCode::HandlerTimeout);
    }
}
