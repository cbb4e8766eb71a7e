use crate::clock::Clock;
use crate::config::Config;
use crate::envelope::build_envelope;
use crate::executor::OperationExecutor;
use crate::guard::{ConcurrencyGuard, DEFAULT_SHARDS};
use crate::metrics::Metrics;
use crate::middleware::{IdempotentRequest, error_response, execution_response};
use crate::producer::EventSink;
use crate::sources::{Source, ValidationError, stripe};
use crate::store::{IdempotencyStore, LeaseStore};
use crate::sweeper::CleanupSweeper;
use crate::webhook::WebhookIdempotencyAdapter;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn IdempotencyStore>,
    pub executor: OperationExecutor,
    pub webhooks: WebhookIdempotencyAdapter,
    pub sweeper: CleanupSweeper,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Metrics,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the idempotency layer over `store`. With distributed locks
    /// enabled the same store also carries the per-key leases.
    pub fn new<S>(
        config: Config,
        store: Arc<S>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        S: IdempotencyStore + LeaseStore + 'static,
    {
        let metrics = Metrics::new()?;

        let leases = config
            .distributed_locks
            .then(|| store.clone() as Arc<dyn LeaseStore>);
        let guard = ConcurrencyGuard::new(DEFAULT_SHARDS, config.lock_lease, leases, clock.clone());

        let store: Arc<dyn IdempotencyStore> = store;
        let executor = OperationExecutor::new(
            store.clone(),
            guard,
            config.ttl.clone(),
            config.wait_timeout,
            clock.clone(),
            metrics.clone(),
        );
        let sweeper = CleanupSweeper::new(
            store.clone(),
            clock.clone(),
            config.abandon_after_seconds,
            config.sweep_interval,
            metrics.clone(),
        );

        Ok(Self {
            webhooks: WebhookIdempotencyAdapter::new(executor.clone()),
            config,
            store,
            executor,
            sweeper,
            sink,
            metrics,
            clock,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/admin/records/{key}", get(get_record))
        .route("/admin/stats", get(store_stats))
        .route("/admin/sweep", post(run_sweep))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/webhooks/{source}", post(webhook_handler))
        .route("/operations/{operation_type}", post(operation_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(render_metrics))
        .merge(admin)
        .layer(DefaultBodyLimit::max(state.config.max_payload_bytes))
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source_path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(source) = Source::from_str(&source_path) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error":"not found"}))).into_response();
    };
    state.metrics.inc_webhook_received(source.as_str());

    let now = state.clock.now_epoch();
    if let Err(error) = validate_source(&state.config, source, &headers, &body, now) {
        return rejection(&state, source, error);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_error) => {
            return rejection(
                &state,
                source,
                ValidationError::BadRequest("invalid json payload"),
            );
        }
    };

    let (event_id, event_type) = match stripe::event_identity(&payload) {
        Ok(identity) => identity,
        Err(error) => return rejection(&state, source, error),
    };

    let topic = source.topic_name(&state.config.kafka.topic_prefix);
    let received_at_ms = state.clock.now_epoch_ms();
    let sink = state.sink.clone();
    let publish_event_id = event_id.clone();

    let result = state
        .webhooks
        .deliver(source.as_str(), &event_id, &body, move || async move {
            let envelope = build_envelope(
                source.as_str(),
                publish_event_id,
                event_type,
                payload,
                received_at_ms,
            );
            sink.publish(&topic, &envelope).await?;
            info!(
                source = source.as_str(),
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                topic = %topic,
                "webhook event published"
            );
            Ok::<Value, anyhow::Error>(json!({
                "status": "accepted",
                "id": envelope.id,
                "event_id": envelope.event_id,
            }))
        })
        .await;

    match result {
        Ok(execution) => execution_response(StatusCode::OK, execution),
        Err(error) => {
            state
                .metrics
                .inc_webhook_rejected(source.as_str(), error.kind());
            error_response(&error)
        }
    }
}

/// Client-submitted operation, published once per idempotency key to
/// `<prefix>.operations`. Only operation types with their own TTL entry are
/// accepted; webhook types arrive through `/webhooks/{source}`.
async fn operation_handler(
    State(state): State<Arc<AppState>>,
    Path(operation_type): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if operation_type.starts_with("webhook") || !state.config.ttl.has_operation(&operation_type) {
        return (StatusCode::NOT_FOUND, Json(json!({"error":"not found"}))).into_response();
    }

    let request = match IdempotentRequest::from_parts(
        &headers,
        &method,
        uri.path(),
        &body,
        &state.config.idempotency_header,
    ) {
        Ok(request) => request,
        Err(error) => {
            warn!(operation_type = %operation_type, error = %error, "idempotency header rejected");
            state.metrics.inc_request(&operation_type, error.kind());
            return error_response(&error);
        }
    };

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error":"invalid json payload"})),
        )
            .into_response();
    };

    let topic = format!("{}.operations", state.config.kafka.topic_prefix);
    let received_at_ms = state.clock.now_epoch_ms();
    let sink = state.sink.clone();
    let key = request.key.to_string();
    let event_type = operation_type.clone();

    let result = state
        .executor
        .run(
            request.into_operation(operation_type.as_str()),
            move || async move {
                let envelope = build_envelope("api", key, event_type, payload, received_at_ms);
                sink.publish(&topic, &envelope).await?;
                info!(
                    key = %envelope.event_id,
                    operation_type = %envelope.event_type,
                    topic = %topic,
                    "operation published"
                );
                Ok::<Value, anyhow::Error>(json!({
                    "status": "accepted",
                    "id": envelope.id,
                    "key": envelope.event_id,
                    "operation_type": envelope.event_type,
                }))
            },
        )
        .await;

    match result {
        Ok(execution) => execution_response(StatusCode::ACCEPTED, execution),
        Err(error) => error_response(&error),
    }
}

fn validate_source(
    config: &Config,
    source: Source,
    headers: &HeaderMap,
    body: &[u8],
    now_epoch: i64,
) -> Result<(), ValidationError> {
    match source {
        Source::Stripe => stripe::validate(
            &config.stripe.webhook_secret,
            config.stripe.timestamp_tolerance_seconds,
            headers,
            body,
            now_epoch,
        ),
    }
}

fn rejection(state: &AppState, source: Source, error: ValidationError) -> Response {
    match error {
        ValidationError::Unauthorized(message) => {
            warn!(source = source.as_str(), reason = message, "webhook authentication failed");
            state
                .metrics
                .inc_webhook_rejected(source.as_str(), "unauthorized");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error":"unauthorized"})),
            )
                .into_response()
        }
        ValidationError::BadRequest(message) => {
            state
                .metrics
                .inc_webhook_rejected(source.as_str(), "bad_request");
            (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.sweeper.is_alive() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status":"not_ready","reason":"cleanup sweeper not running"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "bind": state.config.bind_addr,
            "sweeper_consecutive_failures": state.sweeper.consecutive_failures(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(error) => {
            error!(error = %error, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn require_admin(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.config.admin_token {
        let provided = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();

        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error":"unauthorized"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn get_record(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.store.get(&key) {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error":"not found"}))).into_response(),
        Err(error) => store_unavailable("get", &error),
    }
}

async fn store_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats(state.clock.now_epoch()) {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({"total": stats.total(), "expired": stats.expired, "by_operation": stats.by_operation})),
        )
            .into_response(),
        Err(error) => store_unavailable("stats", &error),
    }
}

async fn run_sweep(State(state): State<Arc<AppState>>) -> Response {
    match state.sweeper.run_once() {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(error) => store_unavailable("sweep", &error),
    }
}

fn store_unavailable(operation: &str, error: &dyn std::error::Error) -> Response {
    error!(operation, error = %error, "admin request failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error":"idempotency store unavailable"})),
    )
        .into_response()
}
