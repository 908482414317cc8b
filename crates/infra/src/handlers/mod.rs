//! Handlers for the job types this service runs.

use std::sync::Arc;

use tracing::warn;

use crate::jobs::{BrokerError, HandlerError, HandlerRegistry, JobContext, JobType};
use crate::mail::MailTransport;
use crate::users::UserStore;

pub mod save_message;
pub mod send_otp_email;

pub use save_message::SaveMessageHandler;
pub use send_otp_email::SendOtpEmailHandler;

/// Registry with a handler for every job type.
pub fn registry(
    transport: Arc<dyn MailTransport>,
    email_from: impl Into<String>,
    users: Arc<dyn UserStore>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            JobType::SendOtpEmail,
            SendOtpEmailHandler::new(transport, email_from),
        )
        .register(JobType::SaveMessage, SaveMessageHandler::new(users))
}

async fn report(ctx: &JobContext, progress: u8) -> Result<(), HandlerError> {
    ctx.update_progress(progress)
        .await
        .map_err(|e: BrokerError| HandlerError::Store(format!("could not record progress: {e}")))
}

/// Progress reported after the job's side effect has happened. Failing here
/// would retry work that is already done, so errors are only logged.
async fn report_done(ctx: &JobContext, progress: u8) {
    if let Err(e) = ctx.update_progress(progress).await {
        warn!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            progress,
            error = %e,
            "could not record progress after side effect"
        );
    }
}
