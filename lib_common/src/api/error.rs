use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::SubmitError;
use crate::readings::{ParseError, UnknownSensorField};
use crate::storage::StoreError;

/// # API Error
///
/// Every way a request can fail, rendered as a JSON body
/// `{"error_type", "message", "detail"}` with a matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The write body is not UTF-8.
    #[error("request body is not valid UTF-8")]
    BodyNotUtf8(#[from] std::string::FromUtf8Error),

    /// The write body holds no reading line.
    #[error("request body holds no reading line")]
    EmptyBody,

    /// A line of the write body could not be parsed.
    #[error("invalid reading line")]
    InvalidLine(#[from] ParseError),

    /// The capture time header is not RFC 3339 or cannot be stored.
    #[error("invalid reading time header")]
    InvalidReadingTime(String),

    /// The `minutes` query parameter is out of range.
    #[error("query window out of range")]
    InvalidWindow(String),

    /// The sensor path segment is not a known field name.
    #[error("unknown sensor")]
    UnknownSensor(#[from] UnknownSensorField),

    /// The write queue stayed full.
    #[error("write queue is full, retry later")]
    Overloaded,

    /// The same idempotency key is still being queued by another request.
    #[error("reading with this key is still being queued, retry later")]
    KeyInFlight,

    /// The writer has shut down.
    #[error("writer is shutting down")]
    WriterClosed,

    /// The store failed to answer a query.
    #[error("time-series store query failed")]
    Store(#[from] StoreError),
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Overloaded(_) => ApiError::Overloaded,
            SubmitError::KeyInFlight => ApiError::KeyInFlight,
            SubmitError::Closed => ApiError::WriterClosed,
        }
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            ApiError::BodyNotUtf8(e) => (StatusCode::BAD_REQUEST, "BodyUtf8Error", Some(e.to_string())),
            ApiError::EmptyBody => (StatusCode::BAD_REQUEST, "EmptyBody", None),
            ApiError::InvalidLine(e) => (StatusCode::BAD_REQUEST, "InvalidLine", Some(e.to_string())),
            ApiError::InvalidReadingTime(raw) => {
                (StatusCode::BAD_REQUEST, "InvalidReadingTime", Some(raw.clone()))
            }
            ApiError::InvalidWindow(detail) => {
                (StatusCode::BAD_REQUEST, "InvalidWindow", Some(detail.clone()))
            }
            ApiError::UnknownSensor(e) => (StatusCode::BAD_REQUEST, "UnknownSensor", Some(e.to_string())),
            ApiError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "Overloaded", None),
            ApiError::KeyInFlight => (StatusCode::SERVICE_UNAVAILABLE, "KeyInFlight", None),
            ApiError::WriterClosed => (StatusCode::SERVICE_UNAVAILABLE, "WriterClosed", None),
            ApiError::Store(e) => (StatusCode::BAD_GATEWAY, "StoreError", Some(e.to_string())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, detail) = self.parts();

        if status.is_server_error() {
            log::error!("{}: {} {:?}", error_type, self, detail);
        } else {
            log::warn!("{}: {} {:?}", error_type, self, detail);
        }

        let body = Json(json!({
            "error_type": error_type,
            "message": self.to_string(),
            "detail": detail,
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
