//! User/message storage written to by the message-persistence handler.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use feedback_core::{Message, User, Username};

pub mod postgres;

pub use postgres::PostgresUserStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserStoreError {
    #[error("user {0} not found")]
    NotFound(Username),
    #[error("user {0} already exists")]
    AlreadyExists(Username),
    #[error("user store error: {0}")]
    Backend(String),
}

/// Users keyed by normalized username.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &Username) -> Result<Option<User>, UserStoreError>;

    /// Append one message to the user's collection in a single write.
    async fn append_message(
        &self,
        username: &Username,
        message: Message,
    ) -> Result<(), UserStoreError>;

    async fn insert(&self, user: User) -> Result<(), UserStoreError>;

    async fn set_accepting_messages(
        &self,
        username: &Username,
        accepting: bool,
    ) -> Result<(), UserStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Username, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_username(&self, username: &Username) -> Result<Option<User>, UserStoreError> {
        Ok(self.users.read().unwrap().get(username).cloned())
    }

    async fn append_message(
        &self,
        username: &Username,
        message: Message,
    ) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap();
        let user = users
            .get_mut(username)
            .ok_or_else(|| UserStoreError::NotFound(username.clone()))?;
        user.messages.push(message);
        Ok(())
    }

    async fn insert(&self, user: User) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap();
        if users.contains_key(&user.username) {
            return Err(UserStoreError::AlreadyExists(user.username));
        }
        users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn set_accepting_messages(
        &self,
        username: &Username,
        accepting: bool,
    ) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap();
        let user = users
            .get_mut(username)
            .ok_or_else(|| UserStoreError::NotFound(username.clone()))?;
        user.is_accepting_messages = accepting;
        Ok(())
    }
}
