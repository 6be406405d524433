//! Built-in methods every relay exposes.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use relay_core::{RelayConfig, ReportId, ReportSink, SessionStore};
use serde_json::{Value, json};

use crate::{
    handler::{Handler, HandlerFailure, HandlerOutput, Invocation},
    registry::{MethodOptions, RegistryBuilder, RegistryError},
    schema::ParamSchema,
};

pub const ECHO: &str = "echo";
pub const SESSION_INFO: &str = "session/info";
pub const SERVER_CONFIG: &str = "server/config";
pub const REPORT_WRITE: &str = "report/write";
pub const REPORT_READ: &str = "report/read";
pub const REPORT_LIST: &str = "report/list";

/// Returns its parameters unchanged.
#[derive(Debug, Default, Clone)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        Ok(HandlerOutput::value(invocation.request.params))
    }
}

/// Summary of the calling session.
pub struct SessionInfoHandler {
    store: Arc<dyn SessionStore>,
}

impl SessionInfoHandler {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for SessionInfoHandler {
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        let session = self
            .store
            .load(invocation.session_id)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))?;
        let value = serde_json::to_value(session.summary())
            .map_err(|e| HandlerFailure::new(e.to_string()))?;
        Ok(HandlerOutput::value(value))
    }
}

/// Effective server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfigHandler {
    snapshot: Value,
}

impl ServerConfigHandler {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            snapshot: serde_json::to_value(config).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl Handler for ServerConfigHandler {
    async fn call(&self, _invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        Ok(HandlerOutput::value(self.snapshot.clone()))
    }
}

/// Stores `content` as a report artifact for the calling request.
///
/// `encoding: "base64"` stores the decoded bytes instead of the UTF-8 text.
#[derive(Debug, Default, Clone)]
pub struct ReportWriteHandler;

#[async_trait]
impl Handler for ReportWriteHandler {
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        let params = invocation.params();
        let content = params["content"].as_str().unwrap_or_default();
        let bytes = match params["encoding"].as_str() {
            Some("base64") => BASE64
                .decode(content)
                .map_err(|e| HandlerFailure::new(format!("content is not valid base64: {e}")))?,
            _ => content.as_bytes().to_vec(),
        };
        Ok(HandlerOutput::value(json!({ "bytes": bytes.len() })).with_artifact(bytes))
    }
}

/// Reads a stored report.
pub struct ReportReadHandler {
    reports: Arc<dyn ReportSink>,
}

impl ReportReadHandler {
    #[must_use]
    pub fn new(reports: Arc<dyn ReportSink>) -> Self {
        Self { reports }
    }
}

#[async_trait]
impl Handler for ReportReadHandler {
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        let id = ReportId::new(invocation.params()["id"].as_str().unwrap_or_default());
        let report = self
            .reports
            .read(&id)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))?;
        let (content, encoding) = match String::from_utf8(report.payload) {
            Ok(text) => (text, "utf8"),
            Err(e) => (BASE64.encode(e.into_bytes()), "base64"),
        };
        Ok(HandlerOutput::value(json!({
            "id": report.id,
            "session_id": report.session_id,
            "request_id": report.request_id,
            "created_at": report.created_at,
            "encoding": encoding,
            "content": content,
        })))
    }
}

/// Lists the reports the calling session has produced, oldest first.
pub struct ReportListHandler {
    reports: Arc<dyn ReportSink>,
}

impl ReportListHandler {
    #[must_use]
    pub fn new(reports: Arc<dyn ReportSink>) -> Self {
        Self { reports }
    }
}

#[async_trait]
impl Handler for ReportListHandler {
    async fn call(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerFailure> {
        let reports = self
            .reports
            .list(invocation.session_id)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))?;
        Ok(HandlerOutput::value(json!({
            "count": reports.len(),
            "reports": reports,
        })))
    }
}

/// Collaborators the built-in methods read from.
pub struct BuiltinDeps {
    pub config: RelayConfig,
    pub store: Arc<dyn SessionStore>,
    pub reports: Arc<dyn ReportSink>,
}

/// Register every built-in method.
///
/// # Errors
/// Returns `DuplicateMethod` if an application handler already claimed one
/// of the names.
pub fn register_builtins(
    builder: &mut RegistryBuilder,
    deps: BuiltinDeps,
) -> Result<(), RegistryError> {
    builder
        .register_with(
            ECHO,
            ParamSchema::any(),
            EchoHandler,
            describe("Return the parameters unchanged"),
        )?
        .register_with(
            SESSION_INFO,
            ParamSchema::any(),
            SessionInfoHandler::new(deps.store),
            describe("Summary of the calling session"),
        )?
        .register_with(
            SERVER_CONFIG,
            ParamSchema::any(),
            ServerConfigHandler::new(&deps.config),
            describe("Effective server configuration"),
        )?
        .register_json(
            REPORT_WRITE,
            json!({
                "type": "object",
                "required": ["content"],
                "properties": {
                    "content": { "type": "string" },
                    "encoding": { "enum": ["utf8", "base64"] }
                }
            }),
            ReportWriteHandler,
            describe("Store content as a report for this request"),
        )?
        .register_json(
            REPORT_READ,
            json!({
                "type": "object",
                "required": ["id"],
                "properties": { "id": { "type": "string" } }
            }),
            ReportReadHandler::new(Arc::clone(&deps.reports)),
            describe("Read a stored report by id"),
        )?
        .register_with(
            REPORT_LIST,
            ParamSchema::any(),
            ReportListHandler::new(deps.reports),
            describe("List reports produced by this session"),
        )?;
    Ok(())
}

fn describe(text: &str) -> MethodOptions {
    MethodOptions {
        description: Some(text.to_string()),
        timeout: None,
    }
}
