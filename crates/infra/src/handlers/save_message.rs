use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use feedback_core::{Message, Username};

use crate::jobs::{HandlerError, JobContext, JobHandler, Payload};
use crate::users::{UserStore, UserStoreError};

use super::{report, report_done};

/// `save-message`: append an anonymous message to the addressed user.
///
/// The accepting-messages check and the append are two store calls, so a
/// user who switches messages off in between can still receive one more.
pub struct SaveMessageHandler {
    users: Arc<dyn UserStore>,
}

impl SaveMessageHandler {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    async fn save(&self, ctx: &JobContext, payload: &Payload) -> Result<Value, HandlerError> {
        report(ctx, 10).await?;

        let raw_username = HandlerError::require_str(payload, "username")?;
        let content = HandlerError::require_str(payload, "content")?;
        report(ctx, 30).await?;

        // A name that cannot be a username cannot have an account either.
        let username = Username::parse(raw_username)
            .map_err(|_| HandlerError::NotFound(format!("user {raw_username} not found")))?;

        let user = self
            .users
            .find_by_username(&username)
            .await
            .map_err(store_error)?
            .ok_or_else(|| HandlerError::NotFound(format!("user {username} not found")))?;
        user.ensure_accepting_messages()?;

        self.users
            .append_message(&username, Message::new(content))
            .await
            .map_err(store_error)?;
        report_done(ctx, 100).await;

        info!(job_id = %ctx.job_id, username = %username, "message saved");
        Ok(json!({
            "success": true,
            "username": username.as_str(),
            "type": "user_message",
        }))
    }
}

fn store_error(e: UserStoreError) -> HandlerError {
    match e {
        UserStoreError::NotFound(_) => HandlerError::NotFound(e.to_string()),
        other => HandlerError::Store(other.to_string()),
    }
}

#[async_trait]
impl JobHandler for SaveMessageHandler {
    async fn handle(&self, ctx: &JobContext, payload: &Payload) -> Result<Value, HandlerError> {
        self.save(ctx, payload)
            .await
            .map_err(|e| e.context("Failed to save message"))
    }
}
