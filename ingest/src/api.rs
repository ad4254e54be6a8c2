use std::collections::HashMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{BulkValidationError, Event};
use crate::limiters::rate::retry_after_secs;
use crate::limiters::AdmissionError;
use crate::pipeline::Rejected;
use crate::sinks::SinkError;
use crate::stats::{Bucket, Totals};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueuedResponse {
    pub status: String,
}

impl QueuedResponse {
    pub fn queued() -> Self {
        Self {
            status: "queued".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkRequest {
    pub events: Vec<Event>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BulkResponse {
    pub accepted_count: usize,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatsResponse {
    pub totals: Totals,
    /// Only present for `group_by=day`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<Bucket>>,
}

/// RFC 7807 body for every error response.
#[derive(Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Problem {
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, Vec<String>>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("validation failed: {detail}")]
    Validation {
        detail: String,
        errors: HashMap<String, Vec<String>>,
    },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("expected application/json")]
    UnsupportedMediaType,
    #[error("invalid or missing API key")]
    Unauthorized,
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("event rejected: {0}")]
    Overloaded(#[from] Rejected),
    #[error("storage not reachable: {0}")]
    NotReady(SinkError),
    #[error("query failed: {0}")]
    Query(#[from] SinkError),
}

impl From<BulkValidationError> for ApiError {
    fn from(err: BulkValidationError) -> Self {
        let detail = err.to_string();
        let errors = match err {
            BulkValidationError::Invalid(errors) => errors,
            BulkValidationError::Empty | BulkValidationError::TooMany(_) => HashMap::new(),
        };
        ApiError::Validation { detail, errors }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidJson(_)
            | ApiError::Validation { .. }
            | ApiError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Admission(AdmissionError::BodyTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Admission(AdmissionError::RateLimited { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Overloaded(_) | ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::InvalidJson(_) => "invalid json",
            ApiError::Validation { .. } => "validation failed",
            ApiError::InvalidParameters(_) => "invalid parameters",
            ApiError::UnsupportedMediaType => "unsupported media type",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Admission(AdmissionError::BodyTooLarge { .. }) => "payload too large",
            ApiError::Admission(AdmissionError::RateLimited { .. }) => "rate limit exceeded",
            ApiError::Overloaded(_) => "overloaded",
            ApiError::NotReady(_) => "not ready",
            ApiError::Query(_) => "query error",
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::InvalidJson(detail)
            | ApiError::Validation { detail, .. }
            | ApiError::InvalidParameters(detail) => detail.clone(),
            ApiError::Overloaded(Rejected::QueueFull) => {
                "ingest queue is full, please retry".to_string()
            }
            ApiError::Overloaded(Rejected::ShuttingDown) => {
                "server is shutting down, please retry".to_string()
            }
            ApiError::NotReady(_) => "database not reachable".to_string(),
            ApiError::Admission(AdmissionError::RateLimited { .. }) => {
                "try again later".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            ApiError::Admission(AdmissionError::RateLimited { retry_after }) => {
                Some(retry_after_secs(*retry_after))
            }
            _ => None,
        };

        let problem = Problem {
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: self.detail(),
            errors: match self {
                ApiError::Validation { errors, .. } => errors,
                _ => HashMap::new(),
            },
        };

        let mut response = (status, Json(problem)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
