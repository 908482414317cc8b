use axum::{
    routing::{get, post},
    Router,
};

pub mod admin;
pub mod jobs;
pub mod system;

/// Router for every endpoint the gateway serves.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/api/check", get(system::check))
        .route("/api/send-otp", post(jobs::send_otp))
        .route("/api/save-message", post(jobs::save_message))
        .route("/api/job-status/:id", get(jobs::job_status))
        .route("/api/queues/:queue/jobs", post(jobs::enqueue))
        .nest("/admin", admin::router())
}
