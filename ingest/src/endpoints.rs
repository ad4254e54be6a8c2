use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn, Span};

use crate::api::{ApiError, BulkRequest, BulkResponse, QueuedResponse, StatsResponse};
use crate::event::{group_field_errors, validate_bulk, validate_event, Event};
use crate::router;
use crate::stats::StatsFilter;

pub const API_KEY_HEADER: &str = "x-api-key";

fn authorize(state: &router::State, headers: &HeaderMap) -> Result<(), ApiError> {
    let key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match state.api_keys.allows(key) {
        true => Ok(()),
        false => Err(ApiError::Unauthorized),
    }
}

fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match content_type.starts_with("application/json") {
        true => Ok(()),
        false => Err(ApiError::UnsupportedMediaType),
    }
}

/// Guards shared by the ingestion routes, in order: API key, content type,
/// then body size.
fn admit(
    state: &router::State,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Bytes, ApiError> {
    authorize(state, headers)?;
    require_json(headers)?;
    state.body_limit.check_headers(headers)?;

    let body = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::from(state.body_limit.rejected()),
        _ => ApiError::InvalidJson(rejection.body_text()),
    })?;
    state.body_limit.check(body.len())?;
    Ok(body)
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidJson(e.to_string()))
}

#[instrument(
    skip_all,
    fields(event_name, user_id, timestamp)
)]
pub async fn post_event(
    state: State<router::State>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let body = admit(&state, &headers, body)?;
    let event: Event = decode(&body)?;

    let errors = validate_event(&event, state.timesource.current_time(), state.clock_skew);
    if !errors.is_empty() {
        debug!(?errors, "event failed validation");
        return Err(ApiError::Validation {
            detail: "one or more fields are invalid".to_string(),
            errors: group_field_errors(errors),
        });
    }

    Span::current().record("event_name", event.name.as_str());
    Span::current().record("user_id", event.user_id.as_str());
    Span::current().record("timestamp", event.timestamp);

    state.pipeline.submit(event).map_err(|rejected| {
        warn!(cause = rejected.as_str(), "event rejected by pipeline");
        rejected
    })?;
    debug!(queued = state.pipeline.queued(), "queued 1 event");

    Ok((StatusCode::ACCEPTED, Json(QueuedResponse::queued())))
}

#[instrument(skip_all, fields(batch_size))]
pub async fn post_events_bulk(
    state: State<router::State>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<BulkResponse>), ApiError> {
    let body = admit(&state, &headers, body)?;
    let BulkRequest { events } = decode(&body)?;
    Span::current().record("batch_size", events.len());

    validate_bulk(
        &events,
        state.bulk_max_events,
        state.timesource.current_time(),
        state.clock_skew,
    )?;

    // Events queued before a rejection stay queued
    let total = events.len();
    for (submitted, event) in events.into_iter().enumerate() {
        if let Err(rejected) = state.pipeline.submit(event) {
            warn!(
                cause = rejected.as_str(),
                submitted, total, "bulk submit stopped early"
            );
            return Err(rejected.into());
        }
    }
    info!(
        accepted = total,
        queued = state.pipeline.queued(),
        "queued bulk events"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(BulkResponse {
            accepted_count: total,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    pub event_name: Option<String>,
    pub channel: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub group_by: Option<String>,
}

fn epoch_param(name: &str, value: Option<&str>) -> Result<Option<i64>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApiError::InvalidParameters(format!("{name} must be epoch seconds"))),
    }
}

#[instrument(skip_all)]
pub async fn get_stats(
    state: State<router::State>,
    headers: HeaderMap,
    Query(params): Query<StatsParams>,
) -> Result<Json<StatsResponse>, ApiError> {
    authorize(&state, &headers)?;
    state.rate_limiter.check()?;

    let from = epoch_param("from", params.from.as_deref())?;
    let to = epoch_param("to", params.to.as_deref())?;
    let filter = StatsFilter::new(
        params.event_name.map(|v| v.trim().to_string()),
        params.channel.map(|v| v.trim().to_string()),
        from,
        to,
        state.timesource.current_time(),
    );
    debug!(?filter, "querying event stats");

    let totals = state.storage.totals(&filter).await?;
    let buckets = match params.group_by.as_deref() {
        Some("day") => Some(state.storage.daily_buckets(&filter).await?),
        _ => None,
    };

    Ok(Json(StatsResponse { totals, buckets }))
}

pub async fn readiness(state: State<router::State>) -> Result<&'static str, ApiError> {
    state.storage.ready().await.map_err(|err| {
        warn!(error = %err, "storage readiness check failed");
        ApiError::NotReady(err)
    })?;
    Ok("ready")
}
