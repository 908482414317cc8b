//! Status Gateway: enqueue endpoints and job status lookups.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use feedback_core::JobId;
use feedback_infra::jobs::{EnqueueOptions, JobType, QueueName};

use crate::app::dto::{
    EnqueueJobRequest, EnqueueResponse, JobStatusResponse, SaveMessageRequest, SendOtpRequest,
};
use crate::app::{errors, services::AppServices};

const OTP_FIELDS_REQUIRED: &str = "Email, username, and OTP are required";
const MESSAGE_FIELDS_REQUIRED: &str = "Username and content are required";

pub async fn send_otp(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SendOtpRequest>, JsonRejection>,
) -> Response {
    let Some(payload) = body.ok().and_then(|Json(req)| req.into_payload()) else {
        return errors::validation_error(OTP_FIELDS_REQUIRED);
    };

    match services
        .queue
        .enqueue(
            QueueName::Email,
            JobType::SendOtpEmail,
            payload,
            EnqueueOptions::default(),
        )
        .await
    {
        Ok(job_id) => Json(EnqueueResponse::queued("OTP email has been queued", job_id)).into_response(),
        Err(e) => errors::enqueue_error_to_response(e, "Error adding job to queue"),
    }
}

pub async fn save_message(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SaveMessageRequest>, JsonRejection>,
) -> Response {
    let Some(payload) = body.ok().and_then(|Json(req)| req.into_payload()) else {
        return errors::validation_error(MESSAGE_FIELDS_REQUIRED);
    };

    match services
        .queue
        .enqueue(
            QueueName::MessagePersist,
            JobType::SaveMessage,
            payload,
            EnqueueOptions::default(),
        )
        .await
    {
        Ok(job_id) => {
            Json(EnqueueResponse::queued("Message has been queued for saving", job_id))
                .into_response()
        }
        Err(e) => errors::enqueue_error_to_response(e, "Error adding message to queue"),
    }
}

/// Ids that do not parse cannot name a job, so they get the same 404.
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::job_not_found();
    };

    match services.queue.get_status(job_id).await {
        Ok(status) => Json(JobStatusResponse::from(status)).into_response(),
        Err(e) => errors::lookup_error_to_response(e),
    }
}

/// Generic producer endpoint: any registered job type on its own queue, with
/// optional retry overrides.
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    body: Result<Json<EnqueueJobRequest>, JsonRejection>,
) -> Response {
    let Ok(queue) = queue.parse::<QueueName>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "Queue not found");
    };
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return errors::validation_error(rejection.body_text()),
    };
    let job_type = match req.job_type.parse::<JobType>() {
        Ok(t) => t,
        Err(e) => return errors::validation_error(e.to_string()),
    };

    match services
        .queue
        .enqueue(queue, job_type, req.payload, req.options)
        .await
    {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(EnqueueResponse::queued("Job has been queued", job_id)),
        )
            .into_response(),
        Err(e) => errors::enqueue_error_to_response(e, "Error adding job to queue"),
    }
}
