use serde::{Deserialize, Serialize};
use serde_json::Value;

use feedback_core::JobId;
use feedback_infra::jobs::{EnqueueOptions, JobState, JobStatus, Payload, QueueName};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /api/send-otp`. Fields are checked by hand so missing and
/// blank values get the same 400 response.
#[derive(Debug, Default, Deserialize)]
pub struct SendOtpRequest {
    pub email: Option<Value>,
    pub username: Option<Value>,
    pub otp: Option<Value>,
}

impl SendOtpRequest {
    pub fn into_payload(self) -> Option<Payload> {
        payload([
            ("email", self.email),
            ("username", self.username),
            ("otp", self.otp),
        ])
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveMessageRequest {
    pub username: Option<Value>,
    pub content: Option<Value>,
}

impl SaveMessageRequest {
    pub fn into_payload(self) -> Option<Payload> {
        payload([("username", self.username), ("content", self.content)])
    }
}

/// Body of `POST /api/queues/:queue/jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobRequest {
    pub job_type: String,
    pub payload: Payload,
    #[serde(default)]
    pub options: EnqueueOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

/// Strings are kept as-is, numbers are stringified, anything else is missing.
fn field_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn payload<const N: usize>(fields: [(&str, Option<Value>); N]) -> Option<Payload> {
    let mut out = Payload::new();
    for (name, value) in fields {
        out.insert(name.to_string(), Value::String(field_text(value)?));
    }
    Some(out)
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub success: bool,
    pub message: &'static str,
    pub job_id: JobId,
}

impl EnqueueResponse {
    pub fn queued(message: &'static str, job_id: JobId) -> Self {
        Self {
            success: true,
            message,
            job_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub success: bool,
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub state: JobState,
    pub progress: u8,
}

impl From<JobStatus> for JobStatusResponse {
    fn from(s: JobStatus) -> Self {
        Self {
            success: true,
            job_id: s.job_id,
            queue_name: s.queue_name,
            state: s.state,
            progress: s.progress,
        }
    }
}
