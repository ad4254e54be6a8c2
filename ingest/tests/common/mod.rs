#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use health::HealthRegistry;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use ingest::pipeline::{Pipeline, PipelineConfig, PipelineTask};
use ingest::router::{router, RouterOptions};
use ingest::sinks::Storage;
use ingest::time::FixedTime;

pub const NOW: i64 = 1_750_000_000;

pub struct TestApp<S> {
    pub router: Router,
    pub storage: Arc<S>,
    pub pipeline: Pipeline,
    pub task: PipelineTask,
    pub liveness: HealthRegistry,
}

pub fn setup<S>(storage: S, pipeline: PipelineConfig, options: RouterOptions) -> TestApp<S>
where
    S: Storage + Send + Sync + 'static,
{
    let storage = Arc::new(storage);
    let liveness = HealthRegistry::new("integration_tests");
    let assembler = liveness.register("batch_assembler", Duration::from_secs(30));
    let (pipeline, task) = Pipeline::start(pipeline, storage.clone(), assembler);

    let router = router(
        FixedTime { time: NOW },
        liveness.clone(),
        pipeline.clone(),
        storage.clone(),
        options,
        None,
    );

    TestApp {
        router,
        storage,
        pipeline,
        task,
        liveness,
    }
}

/// Nothing is flushed before shutdown unless the batch fills up.
pub fn slow_pipeline(queue_capacity: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity,
        batch_max_size: 1000,
        batch_max_wait: Duration::from_secs(3600),
    }
}

pub fn event(user_id: &str) -> Value {
    json!({
        "event_name": "product_view",
        "user_id": user_id,
        "timestamp": NOW - 60,
        "channel": "web",
        "tags": ["promo"],
        "metadata": {"sku": "A-1"}
    })
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = match body.is_empty() {
        true => Value::Null,
        false => serde_json::from_slice(&body).unwrap(),
    };
    (status, value)
}
