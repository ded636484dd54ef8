use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tokio::time::timeout;

use super::{FeedProduct, FeedQuery, Product, Review};
use crate::error::{Result, ServerError};

/// Persistence of products.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Insert `product`, filling `id`, `version` and timestamps.
    async fn create(&self, product: &mut Product) -> Result<()>;

    async fn get_by_id(&self, id: i64) -> Result<Product>;

    /// Write `product` if its stored version still equals `product.version`.
    ///
    /// On success `version` and `updated_at` are refreshed. A missing row is
    /// [`ServerError::NotFound`], a stale version
    /// [`ServerError::EditConflict`].
    async fn update(&self, product: &mut Product) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Products listed for `user_id`, with their wishlist flag.
    async fn feed(&self, user_id: i64, query: &FeedQuery) -> Result<Vec<FeedProduct>>;
}

/// Persistence of reviews.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn create(&self, review: &mut Review) -> Result<()>;

    /// Newest first.
    async fn get_by_product_id(&self, product_id: i64) -> Result<Vec<Review>>;
}

/// PostgreSQL [`ProductStore`].
#[derive(Clone)]
pub struct PgProductStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgProductStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[derive(FromRow)]
struct FeedRecord {
    #[sqlx(flatten)]
    product: Product,
    seller: String,
    review_count: i64,
    is_wishlisted: bool,
}

impl From<FeedRecord> for FeedProduct {
    fn from(record: FeedRecord) -> Self {
        FeedProduct {
            product: record.product,
            seller: record.seller,
            review_count: record.review_count,
            is_wishlisted: record.is_wishlisted,
        }
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn create(&self, product: &mut Product) -> Result<()> {
        let (id, version, created_at, updated_at): (i64, i32, DateTime<Utc>, DateTime<Utc>) =
            timeout(
                self.timeout,
                sqlx::query_as(
                    r#"INSERT INTO products (user_id, name, price, description, categories)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, version, created_at, updated_at"#,
                )
                .bind(product.user_id)
                .bind(&product.name)
                .bind(product.price)
                .bind(&product.description)
                .bind(&product.categories)
                .fetch_one(&self.pool),
            )
            .await??;

        product.id = id;
        product.version = version;
        product.created_at = created_at;
        product.updated_at = updated_at;

        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Product> {
        let product = timeout(
            self.timeout,
            sqlx::query_as::<_, Product>(
                r#"SELECT id, user_id, name, price, description, categories, version,
                created_at, updated_at
                FROM products WHERE id = $1"#,
            )
            .bind(id)
            .fetch_one(&self.pool),
        )
        .await??;

        Ok(product)
    }

    async fn update(&self, product: &mut Product) -> Result<()> {
        // one round-trip: `found` tells a missing row from a stale version.
        let (found, version, updated_at): (bool, Option<i32>, Option<DateTime<Utc>>) =
            timeout(
                self.timeout,
                sqlx::query_as(
                    r#"WITH target AS (
                        SELECT id FROM products WHERE id = $1
                    ), updated AS (
                        UPDATE products
                        SET name = $2, price = $3, description = $4, categories = $5,
                            version = version + 1, updated_at = NOW()
                        WHERE id = $1 AND version = $6
                        RETURNING version, updated_at
                    )
                    SELECT EXISTS (SELECT 1 FROM target), updated.version, updated.updated_at
                    FROM (SELECT 1) AS one LEFT JOIN updated ON true"#,
                )
                .bind(product.id)
                .bind(&product.name)
                .bind(product.price)
                .bind(&product.description)
                .bind(&product.categories)
                .bind(product.version)
                .fetch_one(&self.pool),
            )
            .await??;

        match (version, updated_at) {
            (Some(version), Some(updated_at)) => {
                product.version = version;
                product.updated_at = updated_at;
                Ok(())
            },
            _ if found => {
                metrics::counter!("edit_conflicts_total").increment(1);
                Err(ServerError::EditConflict)
            },
            _ => Err(ServerError::NotFound),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let result = timeout(
            self.timeout,
            sqlx::query("DELETE FROM products WHERE id = $1")
                .bind(id)
                .execute(&self.pool),
        )
        .await??;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }

        Ok(())
    }

    async fn feed(&self, user_id: i64, query: &FeedQuery) -> Result<Vec<FeedProduct>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"SELECT p.id, p.user_id, p.name, p.price, p.description, p.categories,
            p.version, p.created_at, p.updated_at,
            u.username AS seller,
            COUNT(r.id) AS review_count,
            (w.product_id IS NOT NULL) AS is_wishlisted
            FROM products p
            INNER JOIN users u ON u.id = p.user_id
            LEFT JOIN reviews r ON r.product_id = p.id
            LEFT JOIN user_wishlist w ON w.product_id = p.id AND w.user_id = "#,
        );
        builder.push_bind(user_id);
        builder.push(" WHERE true");

        if let Some(search) = query.search() {
            let pattern = format!("%{search}%");
            builder
                .push(" AND (p.name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR p.description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }

        let categories = query.categories();
        if !categories.is_empty() {
            builder.push(" AND p.categories && ").push_bind(categories);
        }
        if let Some(since) = query.since {
            builder.push(" AND p.created_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            builder.push(" AND p.created_at <= ").push_bind(until);
        }

        builder.push(" GROUP BY p.id, u.username, w.product_id");
        builder.push(" ORDER BY p.created_at ").push(query.sort.as_sql());
        builder.push(", p.id ").push(query.sort.as_sql());
        builder.push(" LIMIT ").push_bind(query.limit);
        builder.push(" OFFSET ").push_bind(query.offset);

        let records = timeout(
            self.timeout,
            builder.build_query_as::<FeedRecord>().fetch_all(&self.pool),
        )
        .await??;

        Ok(records.into_iter().map(Into::into).collect())
    }
}

/// PostgreSQL [`ReviewStore`].
#[derive(Clone)]
pub struct PgReviewStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgReviewStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn create(&self, review: &mut Review) -> Result<()> {
        let (id, created_at, username): (i64, DateTime<Utc>, String) = timeout(
            self.timeout,
            sqlx::query_as(
                r#"WITH inserted AS (
                    INSERT INTO reviews (product_id, user_id, rating, comment)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, user_id, created_at
                )
                SELECT inserted.id, inserted.created_at, u.username
                FROM inserted INNER JOIN users u ON u.id = inserted.user_id"#,
            )
            .bind(review.product_id)
            .bind(review.user_id)
            .bind(review.rating)
            .bind(&review.comment)
            .fetch_one(&self.pool),
        )
        .await?
        .map_err(|err| {
            let unknown_product = err
                .as_database_error()
                .and_then(|e| e.constraint())
                .is_some_and(|c| c == "reviews_product_id_fkey");
            if unknown_product {
                ServerError::NotFound
            } else {
                err.into()
            }
        })?;

        review.id = id;
        review.username = username;
        review.created_at = created_at;

        Ok(())
    }

    async fn get_by_product_id(&self, product_id: i64) -> Result<Vec<Review>> {
        let reviews = timeout(
            self.timeout,
            sqlx::query_as::<_, Review>(
                r#"SELECT r.id, r.product_id, r.user_id, u.username, r.rating, r.comment,
                r.created_at
                FROM reviews r INNER JOIN users u ON u.id = r.user_id
                WHERE r.product_id = $1
                ORDER BY r.created_at DESC, r.id DESC"#,
            )
            .bind(product_id)
            .fetch_all(&self.pool),
        )
        .await??;

        Ok(reviews)
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;

    fn store(pool: PgPool) -> PgProductStore {
        PgProductStore::new(pool, Duration::from_secs(5))
    }

    fn product() -> Product {
        Product {
            user_id: 1,
            name: "Lamp".into(),
            price: 12.5,
            description: "A lamp".into(),
            categories: vec!["home".into()],
            ..Default::default()
        }
    }

    #[sqlx::test(fixtures("../../fixtures/users.sql"))]
    async fn test_update_cas(pool: PgPool) {
        let store = store(pool);
        let mut product = product();
        store.create(&mut product).await.unwrap();
        assert_eq!(product.version, 0);

        let mut first = store.get_by_id(product.id).await.unwrap();
        let mut second = first.clone();

        first.name = "Desk lamp".into();
        store.update(&mut first).await.unwrap();
        assert_eq!(first.version, 1);

        second.price = 1.0;
        assert!(matches!(
            store.update(&mut second).await,
            Err(ServerError::EditConflict)
        ));

        second.id = 9999;
        assert!(matches!(
            store.update(&mut second).await,
            Err(ServerError::NotFound)
        ));
    }

    #[sqlx::test(fixtures("../../fixtures/users.sql"))]
    async fn test_concurrent_updates(pool: PgPool) {
        let store = store(pool);
        let mut product = product();
        store.create(&mut product).await.unwrap();

        let (mut a, mut b) = (product.clone(), product.clone());
        a.name = "A".into();
        b.name = "B".into();
        let (ra, rb) = tokio::join!(store.update(&mut a), store.update(&mut b));

        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(store.get_by_id(product.id).await.unwrap().version, 1);
    }

    #[sqlx::test(fixtures("../../fixtures/users.sql"))]
    async fn test_feed(pool: PgPool) {
        let store = store(pool);
        for name in ["Lamp", "Chair", "Table"] {
            let mut product = Product {
                name: name.into(),
                ..product()
            };
            store.create(&mut product).await.unwrap();
        }

        let feed = store
            .feed(1, &FeedQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].seller, "ada");

        let feed = store
            .feed(1, &FeedQuery {
                search: Some("chai".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(feed.len(), 1);
        assert!(!feed[0].is_wishlisted);
    }
}
