use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::timeout;

use super::{Role, User};
use crate::error::{Result, ServerError};

const USER_COLUMNS: &str = r#"
    u.id, u.username, u.email, u.password, u.is_active, u.created_at, u.updated_at,
    r.id AS role_id, r.name AS role_name, r.level AS role_level, r.description AS role_description
"#;

/// Persistence of identities and their pending invitations.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert `user` and its invitation atomically. Fills `id`, `role` and
    /// timestamps on success.
    async fn create_and_invite(
        &self,
        user: &mut User,
        invitation_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()>;

    /// Consume an unexpired invitation and activate its identity.
    ///
    /// Unknown, expired and already consumed tokens are all
    /// [`ServerError::NotFound`].
    async fn activate(&self, invitation_hash: &str) -> Result<i64>;

    /// Get an active identity.
    async fn get_by_id(&self, id: i64) -> Result<User>;

    /// Get an active identity, password hash included.
    async fn get_by_email(&self, email: &str) -> Result<User>;

    /// Remove an identity and every invitation pointing to it.
    async fn delete(&self, id: i64) -> Result<()>;
}

#[derive(FromRow)]
struct UserRecord {
    id: i64,
    username: String,
    email: String,
    password: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    role_id: i64,
    role_name: String,
    role_level: i32,
    role_description: String,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        User {
            id: record.id,
            username: record.username,
            email: record.email,
            password: record.password,
            is_active: record.is_active,
            role: Role {
                id: record.role_id,
                name: record.role_name,
                level: record.role_level,
                description: record.role_description,
            },
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Translate unique violations into their domain error.
fn map_unique_violation(err: sqlx::Error) -> ServerError {
    if let Some(db_err) = err.as_database_error() {
        match db_err.constraint() {
            Some("users_email_key") => return ServerError::DuplicateEmail,
            Some("users_username_key") => return ServerError::DuplicateUsername,
            _ => {},
        }
    }

    err.into()
}

/// PostgreSQL [`UserStore`].
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn fetch_active(&self, column: &str, value: Value<'_>) -> Result<User> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users u INNER JOIN roles r ON r.id = u.role_id
            WHERE u.{column} = $1 AND u.is_active = true"
        );
        let query = sqlx::query_as::<_, UserRecord>(&sql);
        let query = match value {
            Value::Id(id) => query.bind(id),
            Value::Text(text) => query.bind(text),
        };

        let record = timeout(self.timeout, query.fetch_one(&self.pool)).await??;

        Ok(record.into())
    }
}

enum Value<'a> {
    Id(i64),
    Text(&'a str),
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create_and_invite(
        &self,
        user: &mut User,
        invitation_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            let role = sqlx::query_as::<_, Role>(
                "SELECT id, name, level, description FROM roles WHERE name = $1",
            )
            .bind(&user.role.name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ServerError::Internal {
                details: format!("role `{}` is not configured", user.role.name),
                source: None,
            })?;

            let (id, created_at, updated_at): (i64, DateTime<Utc>, DateTime<Utc>) =
                sqlx::query_as(
                    r#"INSERT INTO users (username, email, password, role_id)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, created_at, updated_at"#,
                )
                .bind(&user.username)
                .bind(&user.email)
                .bind(&user.password)
                .bind(role.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_unique_violation)?;

            sqlx::query(
                "INSERT INTO user_invitations (token, user_id, expiry) VALUES ($1, $2, $3)",
            )
            .bind(invitation_hash)
            .bind(id)
            .bind(expiry)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            user.id = id;
            user.role = role;
            user.is_active = false;
            user.created_at = created_at;
            user.updated_at = updated_at;

            Ok::<_, ServerError>(())
        })
        .await?
    }

    async fn activate(&self, invitation_hash: &str) -> Result<i64> {
        timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // row lock serializes concurrent activations of the same token.
            let user_id: i64 = sqlx::query_scalar(
                r#"SELECT user_id FROM user_invitations
                WHERE token = $1 AND expiry > NOW()
                FOR UPDATE"#,
            )
            .bind(invitation_hash)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServerError::NotFound)?;

            sqlx::query(
                "UPDATE users SET is_active = true, updated_at = NOW() WHERE id = $1",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM user_invitations WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok::<_, ServerError>(user_id)
        })
        .await?
    }

    async fn get_by_id(&self, id: i64) -> Result<User> {
        self.fetch_active("id", Value::Id(id)).await
    }

    async fn get_by_email(&self, email: &str) -> Result<User> {
        self.fetch_active("email", Value::Text(email)).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM user_invitations WHERE user_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                return Err(ServerError::NotFound);
            }

            tx.commit().await?;
            Ok::<_, ServerError>(())
        })
        .await?
    }
}
