//! database (db) union structure.
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::authz::{PgRoleStore, RoleStore};
use crate::config::Postgres;
use crate::product::{PgProductStore, PgReviewStore, ProductStore, ReviewStore};
use crate::user::{PgUserStore, UserStore};
use crate::wishlist::{PgWishlistStore, WishlistStore};

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "digitally";
pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: u64 = 5;

/// Custom db structure to pass to Axum.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(config: &Postgres) -> Result<Self, sqlx::Error> {
        let username = config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let password = config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let db = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);
        let hostname = &config.address;

        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .acquire_timeout(Duration::from_secs(
                config.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            ));
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.postgres).await
    }
}

/// Every store the application needs, chosen once at startup.
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn UserStore>,
    pub products: Arc<dyn ProductStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub wishlist: Arc<dyn WishlistStore>,
    pub roles: Arc<dyn RoleStore>,
}

impl Storage {
    /// PostgreSQL stores, each operation bounded by `timeout`.
    pub fn postgres(pool: PgPool, timeout: Duration) -> Self {
        Self {
            users: Arc::new(PgUserStore::new(pool.clone(), timeout)),
            products: Arc::new(PgProductStore::new(pool.clone(), timeout)),
            reviews: Arc::new(PgReviewStore::new(pool.clone(), timeout)),
            wishlist: Arc::new(PgWishlistStore::new(pool.clone(), timeout)),
            roles: Arc::new(PgRoleStore::new(pool, timeout)),
        }
    }

    /// Volatile stores, sharing one [`memory::MemoryStore`].
    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::default());

        Self {
            users: store.clone(),
            products: store.clone(),
            reviews: store.clone(),
            wishlist: store.clone(),
            roles: store,
        }
    }
}
