//! HTTP handlers for the watchdog listener

use crate::coordinator::{Coordinator, WatchdogHealth};
use axum::extract::{Json as ExtractJson, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use watchdog_common::{Error, HealthCheck, MetricCheck, Result};

/// Application state shared across handlers
pub type AppState = Arc<Coordinator>;

/// Create the router with all endpoints
pub fn create_router(coordinator: AppState) -> Router {
    Router::new()
        .route(
            "/healthcheck",
            post(register_health_check).get(list_health_checks),
        )
        .route("/healthcheck/:app", get(list_health_checks_app))
        .route("/healthcheck/:app/:service", get(list_health_checks_service))
        .route(
            "/healthcheck/:app/:service/:partition",
            get(list_health_checks_partition),
        )
        .route("/metrics", get(list_metrics))
        .route("/metrics/:app", post(register_metrics_app).get(list_metrics_app))
        .route(
            "/metrics/:app/:service",
            post(register_metrics_service).get(list_metrics_service),
        )
        .route(
            "/metrics/:app/:service/:partition",
            post(register_metrics_partition).get(list_metrics_partition),
        )
        .route("/watchdog/health", get(watchdog_health))
        .with_state(coordinator)
}

fn error_response(error: Error) -> Response {
    let payload = Json(serde_json::json!({ "error": error.to_string() }));
    match error {
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, payload).into_response(),
        other => {
            warn!("request failed: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, payload).into_response()
        }
    }
}

/// Empty snapshots answer 204, anything else is a JSON array
fn list_response<T: Serialize>(result: Result<Vec<T>>) -> Response {
    match result {
        Ok(items) if items.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(items) => Json(items).into_response(),
        Err(e) => error_response(e),
    }
}

async fn register_health_check(
    State(coordinator): State<AppState>,
    ExtractJson(mut check): ExtractJson<HealthCheck>,
) -> Response {
    // Result fields belong to the engine; a registration always starts clean.
    check.last_attempt = None;
    check.failure_count = 0;
    check.result_code = 0;
    check.duration_ms = 0;

    match coordinator.health_engine().register(check).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_health_checks(State(coordinator): State<AppState>) -> Response {
    list_response(coordinator.health_engine().list(None, None, None))
}

async fn list_health_checks_app(
    State(coordinator): State<AppState>,
    Path(app): Path<String>,
) -> Response {
    list_response(coordinator.health_engine().list(Some(&app), None, None))
}

async fn list_health_checks_service(
    State(coordinator): State<AppState>,
    Path((app, service)): Path<(String, String)>,
) -> Response {
    list_response(
        coordinator
            .health_engine()
            .list(Some(&app), Some(&service), None),
    )
}

async fn list_health_checks_partition(
    State(coordinator): State<AppState>,
    Path((app, service, partition)): Path<(String, String, String)>,
) -> Response {
    list_response(
        coordinator
            .health_engine()
            .list(Some(&app), Some(&service), Some(&partition)),
    )
}

async fn register_metric_check(
    coordinator: &Coordinator,
    app: String,
    service: Option<String>,
    partition: Option<String>,
    metric_names: Vec<String>,
) -> Response {
    let partition = match partition {
        Some(text) => match Uuid::parse_str(&text) {
            Ok(id) => Some(id),
            Err(_) => {
                return error_response(Error::InvalidArgument(format!(
                    "'{}' is not a partition id",
                    text
                )))
            }
        },
        None => None,
    };
    let check = MetricCheck {
        metric_names: metric_names.into_iter().collect(),
        application: app,
        service,
        partition,
    };
    match coordinator.metrics_engine().register(check).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn register_metrics_app(
    State(coordinator): State<AppState>,
    Path(app): Path<String>,
    ExtractJson(names): ExtractJson<Vec<String>>,
) -> Response {
    register_metric_check(&coordinator, app, None, None, names).await
}

async fn register_metrics_service(
    State(coordinator): State<AppState>,
    Path((app, service)): Path<(String, String)>,
    ExtractJson(names): ExtractJson<Vec<String>>,
) -> Response {
    register_metric_check(&coordinator, app, Some(service), None, names).await
}

async fn register_metrics_partition(
    State(coordinator): State<AppState>,
    Path((app, service, partition)): Path<(String, String, String)>,
    ExtractJson(names): ExtractJson<Vec<String>>,
) -> Response {
    register_metric_check(&coordinator, app, Some(service), Some(partition), names).await
}

async fn list_metrics(State(coordinator): State<AppState>) -> Response {
    list_response(coordinator.metrics_engine().list(None, None, None))
}

async fn list_metrics_app(
    State(coordinator): State<AppState>,
    Path(app): Path<String>,
) -> Response {
    list_response(coordinator.metrics_engine().list(Some(&app), None, None))
}

async fn list_metrics_service(
    State(coordinator): State<AppState>,
    Path((app, service)): Path<(String, String)>,
) -> Response {
    list_response(
        coordinator
            .metrics_engine()
            .list(Some(&app), Some(&service), None),
    )
}

async fn list_metrics_partition(
    State(coordinator): State<AppState>,
    Path((app, service, partition)): Path<(String, String, String)>,
) -> Response {
    list_response(
        coordinator
            .metrics_engine()
            .list(Some(&app), Some(&service), Some(&partition)),
    )
}

async fn watchdog_health(State(coordinator): State<AppState>) -> Response {
    match coordinator.watchdog_health() {
        WatchdogHealth::Ok => StatusCode::OK.into_response(),
        WatchdogHealth::NoChecksRegistered => StatusCode::NO_CONTENT.into_response(),
        WatchdogHealth::Unavailable => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
