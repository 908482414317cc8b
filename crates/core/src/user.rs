//! User and message records.
//!
//! Only the fields the message pipeline touches live here; credentials and
//! verification codes belong to the request-handling tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 20;

/// Normalized username: trimmed, lowercased, 3-20 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let normalized = raw.as_ref().trim().to_lowercase();
        let len = normalized.chars().count();
        if len < USERNAME_MIN_LEN {
            return Err(DomainError::validation(format!(
                "username must be at least {USERNAME_MIN_LEN} characters long"
            )));
        }
        if len > USERNAME_MAX_LEN {
            return Err(DomainError::validation(format!(
                "username must be at most {USERNAME_MAX_LEN} characters long"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Username {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

/// An anonymous message left for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A registered user and the messages addressed to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: Username,
    pub email: String,
    pub is_verified: bool,
    pub is_accepting_messages: bool,
    pub messages: Vec<Message>,
}

impl User {
    /// New users start unverified and accepting messages.
    pub fn new(username: Username, email: impl Into<String>) -> Self {
        Self {
            username,
            email: email.into(),
            is_verified: false,
            is_accepting_messages: true,
            messages: Vec::new(),
        }
    }

    /// Fails with `PermissionDenied` when the user has switched messages off.
    pub fn ensure_accepting_messages(&self) -> DomainResult<()> {
        if self.is_accepting_messages {
            Ok(())
        } else {
            Err(DomainError::permission_denied(format!(
                "user {} is not accepting messages",
                self.username
            )))
        }
    }
}
