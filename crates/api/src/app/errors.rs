use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use feedback_infra::jobs::QueueError;

/// `{success: false, error, message}` with the given status.
pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn validation_error(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn job_not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Job not found")
}

/// Map an enqueue failure. Broker details are logged, not returned.
pub fn enqueue_error_to_response(
    err: QueueError,
    broker_message: &'static str,
) -> axum::response::Response {
    match err {
        QueueError::Validation(msg) => validation_error(msg),
        QueueError::NotFound(_) => job_not_found(),
        QueueError::Broker(e) => {
            error!(error = %e, "failed to enqueue job");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "broker_error", broker_message)
        }
    }
}

/// Map a status lookup failure.
pub fn lookup_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(_) => job_not_found(),
        QueueError::Validation(msg) => validation_error(msg),
        QueueError::Broker(e) => {
            error!(error = %e, "failed to read job");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "broker_error",
                "Error fetching job status",
            )
        }
    }
}
