use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderMap};
use metrics::counter;

use crate::limiters::AdmissionError;

/// Byte ceiling for request bodies.
///
/// Requests announcing a larger `Content-Length` are rejected before the body
/// is read; chunked bodies are cut off by the extractor limit from `layer`.
/// A ceiling of zero disables the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BodyLimit {
    max_bytes: usize,
}

impl BodyLimit {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn check(&self, len: usize) -> Result<(), AdmissionError> {
        if self.max_bytes == 0 || len <= self.max_bytes {
            return Ok(());
        }
        Err(self.rejected())
    }

    /// Checks the announced length, if any. Unparseable values are left to
    /// the extractor limit.
    pub fn check_headers(&self, headers: &HeaderMap) -> Result<(), AdmissionError> {
        let announced = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        match announced {
            Some(len) => self.check(len),
            None => Ok(()),
        }
    }

    /// Rejection for a body that went over the limit while being read.
    pub fn rejected(&self) -> AdmissionError {
        let rejected = AdmissionError::BodyTooLarge {
            limit: self.max_bytes,
        };
        counter!("ingest_admission_rejected_total", "guard" => rejected.guard()).increment(1);
        rejected
    }

    pub fn layer(&self) -> DefaultBodyLimit {
        match self.max_bytes {
            0 => DefaultBodyLimit::disable(),
            max => DefaultBodyLimit::max(max),
        }
    }
}
