use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Liveness check.
pub async fn check() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Queue server is running",
    }))
}
