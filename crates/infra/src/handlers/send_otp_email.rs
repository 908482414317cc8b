use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::jobs::{HandlerError, JobContext, JobHandler, Payload};
use crate::mail::{render_otp_email, MailTransport, OutgoingMail, OTP_SUBJECT};

use super::{report, report_done};

/// `send-otp-email`: render the verification mail and hand it to the transport.
///
/// Retries may send the same code twice; nothing else is written.
pub struct SendOtpEmailHandler {
    transport: Arc<dyn MailTransport>,
    from: String,
}

impl SendOtpEmailHandler {
    pub fn new(transport: Arc<dyn MailTransport>, from: impl Into<String>) -> Self {
        Self {
            transport,
            from: from.into(),
        }
    }

    async fn send(&self, ctx: &JobContext, payload: &Payload) -> Result<Value, HandlerError> {
        report(ctx, 10).await?;

        let email = HandlerError::require_str(payload, "email")?;
        let username = HandlerError::require_str(payload, "username")?;
        let otp = HandlerError::require_str(payload, "otp")?;
        report(ctx, 30).await?;

        let mail = OutgoingMail {
            from: self.from.clone(),
            to: email.to_string(),
            subject: OTP_SUBJECT.to_string(),
            html: render_otp_email(username, otp),
        };
        report(ctx, 60).await?;

        let sent = self
            .transport
            .send(&mail)
            .await
            .map_err(|e| HandlerError::Transport(e.to_string()))?;
        report_done(ctx, 100).await;

        info!(job_id = %ctx.job_id, to = %email, message_id = %sent.message_id, "otp email sent");
        Ok(json!({
            "success": true,
            "messageId": sent.message_id,
        }))
    }
}

#[async_trait]
impl JobHandler for SendOtpEmailHandler {
    async fn handle(&self, ctx: &JobContext, payload: &Payload) -> Result<Value, HandlerError> {
        self.send(ctx, payload)
            .await
            .map_err(|e| e.context("Failed to send email"))
    }
}
