//! HTTP error surface.
//!
//! Core errors carry their own HTTP-style status. Not-found lookups are
//! served with a short positive cache-control so transient misses do not
//! poison downstream caches; everything else is `no-cache`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use appstand_core::RegistryError;

/// Cache-control served with not-found errors.
const NOT_FOUND_CACHE: &str = "max-age=60";

/// A core error ready to be serialised.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    not_found: bool,
}

impl ApiError {
    /// A plain 404 with a custom message (unknown space, missing
    /// attachment).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            not_found: true,
        }
    }

    /// A plain 400 with a custom message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            not_found: false,
        }
    }

    /// A plain 401 with a custom message.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            not_found: false,
        }
    }

    /// Whether this is a lookup miss (as opposed to a real failure).
    pub fn is_not_found(&self) -> bool {
        self.not_found
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
            not_found: err.is_not_found(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let cache_control = if self.not_found {
            HeaderValue::from_static(NOT_FOUND_CACHE)
        } else {
            HeaderValue::from_static("no-cache")
        };
        let mut response =
            (self.status, Json(json!({ "error": self.message }))).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, cache_control);
        response
    }
}
