//! Wire-level error taxonomy shared by every component.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error code delivered to clients inside error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown session or report.
    NotFound,
    /// Session timed out.
    Expired,
    /// Method name registered twice.
    DuplicateMethod,
    /// No handler is registered under the method name.
    UnknownMethod,
    /// Request parameters failed schema validation.
    InvalidParams,
    /// Handler reported a failure.
    HandlerError,
    /// Handler exceeded its execution budget.
    HandlerTimeout,
    /// A report already exists under the identifier with different content.
    ReportConflict,
    /// Durable read or write failed.
    StorageFailure,
    /// Request identifier was already used in this session.
    DuplicateRequest,
    /// Inbound frame could not be parsed.
    InvalidFrame,
}

impl ErrorCode {
    /// Snake-case name as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::DuplicateMethod => "duplicate_method",
            Self::UnknownMethod => "unknown_method",
            Self::InvalidParams => "invalid_params",
            Self::HandlerError => "handler_error",
            Self::HandlerTimeout => "handler_timeout",
            Self::ReportConflict => "report_conflict",
            Self::StorageFailure => "storage_failure",
            Self::DuplicateRequest => "duplicate_request",
            Self::InvalidFrame => "invalid_frame",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried by error events and HTTP error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorBody {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
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

/// Errors that know which wire code they map to.
pub trait Coded: std::fmt::Display {
    /// Wire code for this error.
    fn code(&self) -> ErrorCode;

    /// Structured detail, if the error carries any.
    fn detail(&self) -> Option<Value> {
        None
    }

    /// Convert into a wire error body.
    fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            detail: self.detail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorCode::HandlerTimeout).unwrap();
        assert_eq!(json, "\"handler_timeout\"");
        assert_eq!(ErrorCode::HandlerTimeout.as_str(), "handler_timeout");
    }

    #[test]
    fn test_body_omits_missing_detail() {
        let body = ErrorBody::new(ErrorCode::UnknownMethod, "no such method: nope");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "unknown_method");
        assert!(json.get("detail").is_none());
    }
}
