//! HTTP error mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_core::{Coded, ErrorBody, ErrorCode, ReportError};
use relay_session::CoordinatorError;
use thiserror::Error;
use tracing::error;

use crate::protocol::ServerMessage;

/// Errors returned by HTTP endpoints.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Report(#[from] ReportError),
    /// Inbound frame could not be parsed or is not valid here.
    #[error("{}", .0.message)]
    Frame(ErrorBody),
    /// The request was accepted but its result could not be delivered.
    #[error("{}", .0.message)]
    Delivery(ErrorBody),
}

impl TransportError {
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::Frame(ErrorBody::new(ErrorCode::InvalidFrame, message))
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Coordinator(e) => e.to_body(),
            Self::Report(e) => e.to_body(),
            Self::Frame(body) | Self::Delivery(body) => body.clone(),
        }
    }
}

/// HTTP status for a wire error code.
#[must_use]
pub const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Expired => StatusCode::GONE,
        ErrorCode::InvalidFrame | ErrorCode::InvalidParams | ErrorCode::UnknownMethod => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::DuplicateRequest | ErrorCode::ReportConflict => StatusCode::CONFLICT,
        ErrorCode::HandlerTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::StorageFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::HandlerError | ErrorCode::DuplicateMethod => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let body = self.body();
        let status = status_for(body.code);
        if status.is_server_error() {
            error!(code = %body.code, "Request failed: {}", body.message);
        }
        (status, Json(ServerMessage::Error(body))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{RequestId, StorageError};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_status_codes() {
        let not_found: TransportError =
            CoordinatorError::Storage(StorageError::NotFound(Uuid::new_v4())).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let expired: TransportError =
            CoordinatorError::Storage(StorageError::Expired(Uuid::new_v4())).into();
        assert_eq!(expired.into_response().status(), StatusCode::GONE);

        let duplicate: TransportError =
            CoordinatorError::DuplicateRequest(RequestId::from("1")).into();
        assert_eq!(duplicate.into_response().status(), StatusCode::CONFLICT);

        let frame = TransportError::invalid_frame("bad");
        assert_eq!(frame.into_response().status(), StatusCode::BAD_REQUEST);

        let storage: TransportError =
            CoordinatorError::Storage(StorageError::Internal("disk".into())).into();
        assert_eq!(
            storage.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
