//! Postgres-backed user store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use feedback_core::{Message, User, Username};

use super::{UserStore, UserStoreError};

impl From<sqlx::Error> for UserStoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, UserStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the `users` and `messages` tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), UserStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                is_verified BOOLEAN NOT NULL DEFAULT FALSE,
                is_accepting_messages BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL REFERENCES users (username) ON DELETE CASCADE,
                content TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_username ON messages (username, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn find_by_username(&self, username: &Username) -> Result<Option<User>, UserStoreError> {
        let Some(row) = sqlx::query(
            "SELECT email, is_verified, is_accepting_messages FROM users WHERE username = $1",
        )
        .bind(username.as_str())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let messages = sqlx::query(
            "SELECT content, created_at FROM messages WHERE username = $1 ORDER BY created_at, id",
        )
        .bind(username.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| Message {
            content: r.get("content"),
            created_at: r.get::<DateTime<Utc>, _>("created_at"),
        })
        .collect();

        Ok(Some(User {
            username: username.clone(),
            email: row.get("email"),
            is_verified: row.get("is_verified"),
            is_accepting_messages: row.get("is_accepting_messages"),
            messages,
        }))
    }

    async fn append_message(
        &self,
        username: &Username,
        message: Message,
    ) -> Result<(), UserStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (username, content, created_at)
            SELECT $1, $2, $3
            WHERE EXISTS (SELECT 1 FROM users WHERE username = $1)
            "#,
        )
        .bind(username.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UserStoreError::NotFound(username.clone()));
        }
        Ok(())
    }

    async fn insert(&self, user: User) -> Result<(), UserStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, email, is_verified, is_accepting_messages)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (username) DO NOTHING
            "#,
        )
        .bind(user.username.as_str())
        .bind(&user.email)
        .bind(user.is_verified)
        .bind(user.is_accepting_messages)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UserStoreError::AlreadyExists(user.username));
        }
        for message in user.messages {
            self.append_message(&user.username, message).await?;
        }
        Ok(())
    }

    async fn set_accepting_messages(
        &self,
        username: &Username,
        accepting: bool,
    ) -> Result<(), UserStoreError> {
        let result = sqlx::query("UPDATE users SET is_accepting_messages = $2 WHERE username = $1")
            .bind(username.as_str())
            .bind(accepting)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(UserStoreError::NotFound(username.clone()));
        }
        Ok(())
    }
}
