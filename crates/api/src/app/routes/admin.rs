//! Read-only admin view over queues and workers.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::error;

use feedback_infra::jobs::{Broker, BrokerError, JobState, QueueName};

use crate::app::dto::ListJobsQuery;
use crate::app::{dashboard, errors, services::AppServices};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/queues", get(overview))
        .route("/queues/:queue/jobs", get(list_jobs))
        .route("/workers", get(workers))
}

fn broker_error(e: BrokerError) -> Response {
    error!(error = %e, "admin query failed");
    errors::json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "broker_error",
        "Error reading queue state",
    )
}

async fn overview(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue in QueueName::ALL {
        match services.broker().counts(queue).await {
            Ok(counts) => queues.push((queue, counts)),
            Err(e) => return broker_error(e),
        }
    }
    Html(dashboard::render_overview(&queues, &services.worker_stats())).into_response()
}

async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let Ok(queue) = queue.parse::<QueueName>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "Queue not found");
    };
    let state = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(state) => state,
        Err(e) => return errors::validation_error(e.to_string()),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match services.broker().list(queue, state, limit).await {
        Ok(jobs) => Json(json!({
            "success": true,
            "queue": queue,
            "state": state,
            "count": jobs.len(),
            "jobs": jobs,
        }))
        .into_response(),
        Err(e) => broker_error(e),
    }
}

async fn workers(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "workers": services.worker_stats(),
    }))
}
