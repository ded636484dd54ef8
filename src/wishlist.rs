//! Products saved by an identity.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::timeout;

use crate::error::{Result, ServerError};

/// Persistence of wishlists. One entry per (user, product).
#[async_trait]
pub trait WishlistStore: Send + Sync {
    /// An existing entry is [`ServerError::Conflict`].
    async fn add(&self, user_id: i64, product_id: i64) -> Result<()>;

    /// Removing a missing entry is not an error.
    async fn remove(&self, user_id: i64, product_id: i64) -> Result<()>;
}

fn map_constraint_violation(err: sqlx::Error) -> ServerError {
    if let Some(db_err) = err.as_database_error() {
        match db_err.constraint() {
            Some("user_wishlist_pkey") => return ServerError::Conflict,
            Some("user_wishlist_product_id_fkey") => return ServerError::NotFound,
            _ => {},
        }
    }

    err.into()
}

/// PostgreSQL [`WishlistStore`].
#[derive(Clone)]
pub struct PgWishlistStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgWishlistStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl WishlistStore for PgWishlistStore {
    async fn add(&self, user_id: i64, product_id: i64) -> Result<()> {
        timeout(
            self.timeout,
            sqlx::query("INSERT INTO user_wishlist (user_id, product_id) VALUES ($1, $2)")
                .bind(user_id)
                .bind(product_id)
                .execute(&self.pool),
        )
        .await?
        .map_err(map_constraint_violation)?;

        Ok(())
    }

    async fn remove(&self, user_id: i64, product_id: i64) -> Result<()> {
        timeout(
            self.timeout,
            sqlx::query("DELETE FROM user_wishlist WHERE user_id = $1 AND product_id = $2")
                .bind(user_id)
                .bind(product_id)
                .execute(&self.pool),
        )
        .await??;

        Ok(())
    }
}
