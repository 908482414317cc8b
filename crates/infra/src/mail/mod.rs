//! Outgoing mail: OTP template and delivery transports.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::html;

pub mod http;

pub use http::HttpMailTransport;

pub const OTP_SUBJECT: &str = "Verification Code for Feedback App";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("mail request failed: {0}")]
    Request(String),
    #[error("mail API rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("mail API returned an unexpected response: {0}")]
    InvalidResponse(String),
    #[error("mail client setup failed: {0}")]
    Setup(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<SentMail, TransportError>;
}

/// Render the verification email. Same inputs always give the same HTML.
pub fn render_otp_email(username: &str, otp: &str) -> String {
    let username = html::escape(username);
    let otp = html::escape(otp);
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2>Hello {username},</h2>
  <p>Thank you for registering. Please use the following verification code to complete your registration:</p>
  <div style="background-color: #f4f4f4; padding: 10px; text-align: center; font-size: 24px; font-weight: bold; margin: 20px 0;">
    {otp}
  </div>
  <p>If you did not request this code, please ignore this email.</p>
  <p>This code will expire in 10 minutes.</p>
</div>"#
    )
}

/// Development transport: logs the mail instead of delivering it.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<SentMail, TransportError> {
        let message_id = format!("<{}@feedback.local>", Uuid::now_v7());
        info!(
            to = %mail.to,
            from = %mail.from,
            subject = %mail.subject,
            message_id = %message_id,
            "mail delivered to log transport"
        );
        Ok(SentMail { message_id })
    }
}
