//! Error taxonomy for the protocol surface.
//!
//! Every failure that can reach a client carries an HTTP status. Validation,
//! conditional-request, and content-type failures surface directly; store
//! failures map to 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("resource not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("not implemented")]
    NotImplemented,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// The plain-text body sent with the error status: the status text,
    /// with the detail appended as a note when one exists.
    pub fn body(&self) -> String {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("error");
        match self {
            ApiError::NotFound
            | ApiError::MethodNotAllowed
            | ApiError::PreconditionFailed
            | ApiError::NotImplemented => reason.to_string(),
            other => format!("{reason} [note: {other}]"),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn bad_request(err: impl std::fmt::Display) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}
