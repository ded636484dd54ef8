//! Ownership and role based authorization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::timeout;

use crate::error::{Result, ServerError};
use crate::user::{Role, User};

pub const MODERATOR: &str = "moderator";
pub const ADMIN: &str = "admin";

/// Lookup of configured roles.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Role>;
}

/// PostgreSQL [`RoleStore`].
#[derive(Clone)]
pub struct PgRoleStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgRoleStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl RoleStore for PgRoleStore {
    async fn get_by_name(&self, name: &str) -> Result<Role> {
        let role = timeout(
            self.timeout,
            sqlx::query_as::<_, Role>(
                "SELECT id, name, level, description FROM roles WHERE name = $1",
            )
            .bind(name)
            .fetch_one(&self.pool),
        )
        .await??;

        Ok(role)
    }
}

/// Decide whether a caller may act on a resource.
#[derive(Clone)]
pub struct Authorizer {
    roles: Arc<dyn RoleStore>,
}

impl Authorizer {
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    /// Owners are always allowed. Others need a role level at least equal
    /// to `required`'s.
    ///
    /// An unknown `required` role is a configuration error, not a denial.
    pub async fn authorize(
        &self,
        caller: &User,
        owner_id: i64,
        required: &str,
    ) -> Result<bool> {
        if caller.id == owner_id {
            return Ok(true);
        }

        let role = match self.roles.get_by_name(required).await {
            Ok(role) => role,
            Err(ServerError::NotFound) => {
                return Err(ServerError::Internal {
                    details: format!("role `{required}` is not configured"),
                    source: None,
                });
            },
            Err(err) => return Err(err),
        };

        Ok(caller.role.level >= role.level)
    }

    /// Same as [`Authorizer::authorize`], denial as [`ServerError::Forbidden`].
    pub async fn require(&self, caller: &User, owner_id: i64, required: &str) -> Result<()> {
        if self.authorize(caller, owner_id, required).await? {
            Ok(())
        } else {
            tracing::debug!(user_id = caller.id, owner_id, required, "access denied");
            Err(ServerError::Forbidden)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;

    fn caller(id: i64, role: &str, level: i32) -> User {
        User {
            id,
            role: Role {
                name: role.into(),
                level,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn authorizer() -> Authorizer {
        Authorizer::new(Arc::new(MemoryStore::default()))
    }

    #[tokio::test]
    async fn test_owner_short_circuits() {
        // even an unknown role is never looked up for the owner.
        assert!(
            authorizer()
                .authorize(&caller(1, "user", 1), 1, "superuser")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_role_levels() {
        let authz = authorizer();

        assert!(!authz.authorize(&caller(1, "user", 1), 2, MODERATOR).await.unwrap());
        assert!(authz.authorize(&caller(1, "moderator", 2), 2, MODERATOR).await.unwrap());
        assert!(!authz.authorize(&caller(1, "moderator", 2), 2, ADMIN).await.unwrap());
        assert!(authz.authorize(&caller(1, "admin", 3), 2, MODERATOR).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_role_is_internal() {
        assert!(matches!(
            authorizer().authorize(&caller(1, "user", 1), 2, "superuser").await,
            Err(ServerError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_require_forbidden() {
        assert!(matches!(
            authorizer().require(&caller(1, "user", 1), 2, ADMIN).await,
            Err(ServerError::Forbidden)
        ));
    }
}
