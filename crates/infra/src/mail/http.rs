//! JSON mail API transport.
//!
//! Sends `POST {api_url}` with `{from, to, subject, html}` and a bearer key,
//! and expects `{"id": "..."}` back.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{MailTransport, OutgoingMail, SentMail, TransportError};

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpMailTransport {
    /// `timeout` bounds each request from connect to the last byte of the body.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            timeout,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Request(format!(
                "no response within {}ms",
                self.timeout.as_millis()
            ))
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<SentMail, TransportError> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&SendRequest {
                from: &mail.from,
                to: &mail.to,
                subject: &mail.subject,
                html: &mail.html,
            })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.request_error(e)
                } else {
                    TransportError::InvalidResponse(e.to_string())
                }
            })?;
        if body.id.trim().is_empty() {
            return Err(TransportError::InvalidResponse("empty message id".into()));
        }
        Ok(SentMail { message_id: body.id })
    }
}
