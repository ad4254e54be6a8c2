use std::time::Duration;

use thiserror::Error;

pub mod body;
pub mod rate;

/// Rejections issued before a request reaches the pipeline or storage.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl AdmissionError {
    /// Label used on `ingest_admission_rejected_total`.
    pub fn guard(&self) -> &'static str {
        match self {
            AdmissionError::BodyTooLarge { .. } => "body_size",
            AdmissionError::RateLimited { .. } => "rate",
        }
    }
}
