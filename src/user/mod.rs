mod cache;
mod repository;
mod service;

pub use cache::*;
pub use repository::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role given to new identities.
pub const DEFAULT_ROLE: &str = "user";

/// Identity as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// Argon2id PHC string. Never serialized, not even into the cache.
    #[serde(skip)]
    pub password: String,
    pub is_active: bool,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Roles are totally ordered by `level`.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub level: i32,
    pub description: String,
}

/// Draft of an identity before provisioning.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub role: String,
}

impl NewUser {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            role: DEFAULT_ROLE.to_owned(),
        }
    }

    /// Update `role` field on [`NewUser`].
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// Pending activation of an identity. Only the token digest is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct Invitation {
    pub user_id: i64,
    pub token_hash: String,
    pub expiry: DateTime<Utc>,
}
