use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ApiKeys, Config};
use crate::endpoints;
use crate::limiters::body::BodyLimit;
use crate::limiters::rate::RateLimiter;
use crate::pipeline::Pipeline;
use crate::prometheus::track_metrics;
use crate::sinks::Storage;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub pipeline: Pipeline,
    pub storage: Arc<dyn Storage + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub rate_limiter: Arc<RateLimiter>,
    pub body_limit: BodyLimit,
    pub api_keys: Arc<ApiKeys>,
    pub clock_skew: Duration,
    pub bulk_max_events: usize,
}

/// Request guards and limits for the HTTP surface.
#[derive(Clone, Debug)]
pub struct RouterOptions {
    pub api_keys: ApiKeys,
    pub max_body_bytes: usize,
    pub stats_per_minute: i64,
    pub clock_skew: Duration,
    pub bulk_max_events: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            api_keys: ApiKeys::default(),
            max_body_bytes: 1024 * 1024,
            stats_per_minute: 20,
            clock_skew: Duration::from_secs(300),
            bulk_max_events: 100,
        }
    }
}

impl From<&Config> for RouterOptions {
    fn from(config: &Config) -> Self {
        Self {
            api_keys: config.api_keys.clone(),
            max_body_bytes: config.max_body_bytes,
            stats_per_minute: config.rate_limit_metrics_per_min,
            clock_skew: config.clock_skew(),
            bulk_max_events: config.bulk_max_events,
        }
    }
}

async fn index() -> &'static str {
    "ingest"
}

pub fn router<TZ, S>(
    timesource: TZ,
    liveness: HealthRegistry,
    pipeline: Pipeline,
    storage: Arc<S>,
    options: RouterOptions,
    metrics: Option<PrometheusHandle>,
) -> Router
where
    TZ: TimeSource + Send + Sync + 'static,
    S: Storage + Send + Sync + 'static,
{
    let body_limit = BodyLimit::new(options.max_body_bytes);
    let state = State {
        pipeline,
        storage,
        timesource: Arc::new(timesource),
        rate_limiter: Arc::new(RateLimiter::new(options.stats_per_minute)),
        body_limit,
        api_keys: Arc::new(options.api_keys),
        clock_skew: options.clock_skew,
        bulk_max_events: options.bulk_max_events,
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(endpoints::readiness))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/events", post(endpoints::post_event))
        .route("/events/bulk", post(endpoints::post_events_bulk))
        .route("/metrics", get(endpoints::get_stats))
        .layer(body_limit.layer())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The stats query owns /metrics, prometheus is served on /_metrics
    match metrics {
        Some(handle) => router.route("/_metrics", get(move || ready(handle.render()))),
        None => router,
    }
}
