#[cfg(test)]
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
#[cfg(test)]
use std::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::timeout;

use super::{User, UserStore};
use crate::error::{Result, ServerError};

/// Time-to-live of a cached identity when not configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 10);

/// Redis key of a cached identity.
pub fn user_key(id: i64) -> String {
    format!("user-{id}")
}

/// Shared key-value store of identities.
#[async_trait]
pub trait UserCache: Send + Sync {
    /// `Ok(None)` is a miss. A stored empty payload is a hit on a
    /// zero-valued identity.
    async fn get(&self, id: i64) -> Result<Option<User>>;

    /// Store `user` under its own id for `ttl`.
    async fn set(&self, user: &User, ttl: Duration) -> Result<()>;
}

fn decode(payload: &str) -> Result<User> {
    if payload.is_empty() {
        return Ok(User::default());
    }

    serde_json::from_str(payload)
        .map_err(|err| ServerError::internal("corrupted cached user", err))
}

fn encode(user: &User) -> Result<String> {
    if user.id == 0 {
        return Err(ServerError::Internal {
            details: "cannot cache a user without id".into(),
            source: None,
        });
    }

    serde_json::to_string(user)
        .map_err(|err| ServerError::internal("cannot serialize user", err))
}

/// Redis backed [`UserCache`].
#[derive(Clone)]
pub struct RedisUserCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisUserCache {
    /// Connect to `url`. The manager reconnects on its own afterwards.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| ServerError::internal("invalid redis url", err))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| ServerError::internal("cannot connect to redis", err))?;

        tracing::info!("redis connected");

        Ok(Self { conn, timeout })
    }
}

#[async_trait]
impl UserCache for RedisUserCache {
    async fn get(&self, id: i64) -> Result<Option<User>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = timeout(self.timeout, conn.get(user_key(id)))
            .await?
            .map_err(|err| ServerError::internal("redis get failed", err))?;

        payload.as_deref().map(decode).transpose()
    }

    async fn set(&self, user: &User, ttl: Duration) -> Result<()> {
        let payload = encode(user)?;
        let mut conn = self.conn.clone();

        timeout(
            self.timeout,
            conn.set_ex::<_, _, ()>(user_key(user.id), payload, ttl.as_secs()),
        )
        .await?
        .map_err(|err| ServerError::internal("redis set failed", err))
    }
}

/// In-process [`UserCache`] test double with Redis expiry semantics.
///
/// Without Redis the service runs uncached, reads go to the store.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryUserCache {
    entries: tokio::sync::Mutex<HashMap<i64, (Instant, String)>>,
}

#[cfg(test)]
#[async_trait]
impl UserCache for MemoryUserCache {
    async fn get(&self, id: i64) -> Result<Option<User>> {
        let mut entries = self.entries.lock().await;

        match entries.get(&id) {
            Some((deadline, _)) if *deadline <= Instant::now() => {
                entries.remove(&id);
                Ok(None)
            },
            Some((_, payload)) => decode(payload).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, user: &User, ttl: Duration) -> Result<()> {
        let payload = encode(user)?;
        self.entries
            .lock()
            .await
            .insert(user.id, (Instant::now() + ttl, payload));
        Ok(())
    }
}

/// Cache-aside reads of identities.
///
/// Entries are never invalidated, they only expire. Concurrent misses on the
/// same id may each reach the store.
#[derive(Clone)]
pub struct CachedUsers {
    store: Arc<dyn UserStore>,
    cache: Option<Arc<dyn UserCache>>,
    ttl: Duration,
}

impl CachedUsers {
    pub fn new(
        store: Arc<dyn UserStore>,
        cache: Option<Arc<dyn UserCache>>,
        ttl: Duration,
    ) -> Self {
        Self { store, cache, ttl }
    }

    /// Get an active identity, from cache when possible.
    pub async fn get(&self, id: i64) -> Result<User> {
        let store = Arc::clone(&self.store);
        self.read_through(id, || async move { store.get_by_id(id).await })
            .await
    }

    /// Serve `id` from cache, or call `loader` and populate the cache.
    ///
    /// Cache failures and loader failures are both returned as is.
    pub async fn read_through<F, Fut>(&self, id: i64, loader: F) -> Result<User>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<User>>,
    {
        let Some(cache) = &self.cache else {
            return loader().await;
        };

        if let Some(user) = cache.get(id).await? {
            metrics::counter!("user_cache_requests_total", "result" => "hit")
                .increment(1);
            return Ok(user);
        }
        metrics::counter!("user_cache_requests_total", "result" => "miss")
            .increment(1);

        let user = loader().await?;
        cache.set(&user, self.ttl).await?;

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::database::memory::MemoryStore;

    fn user(id: i64) -> User {
        User {
            id,
            username: "ada".into(),
            email: "ada@digitally.shop".into(),
            password: "$argon2id$secret".into(),
            is_active: true,
            ..Default::default()
        }
    }

    fn cached(cache: Arc<MemoryUserCache>) -> CachedUsers {
        CachedUsers::new(Arc::new(MemoryStore::default()), Some(cache), DEFAULT_TTL)
    }

    #[tokio::test]
    async fn test_loader_called_once() {
        let users = cached(Arc::new(MemoryUserCache::default()));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let found = users
                .read_through(7, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(user(7))
                })
                .await
                .unwrap();
            assert_eq!(found.id, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let users = cached(Arc::new(MemoryUserCache::default()));

        let err = users
            .read_through(7, || async { Err(ServerError::NotFound) })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound));

        let found = users.read_through(7, || async { Ok(user(7)) }).await;
        assert!(found.is_ok());
    }

    #[tokio::test]
    async fn test_empty_payload_is_zero_value_hit() {
        let cache = Arc::new(MemoryUserCache::default());
        cache
            .entries
            .lock()
            .await
            .insert(9, (Instant::now() + DEFAULT_TTL, String::new()));

        let found = cached(cache)
            .read_through(9, || async { Ok(user(9)) })
            .await
            .unwrap();
        assert_eq!(found, User::default());
    }

    #[tokio::test]
    async fn test_set_rejects_missing_id() {
        let cache = MemoryUserCache::default();
        assert!(matches!(
            cache.set(&User::default(), DEFAULT_TTL).await,
            Err(ServerError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_password_never_cached() {
        let cache = MemoryUserCache::default();
        cache.set(&user(3), DEFAULT_TTL).await.unwrap();

        let hit = cache.get(3).await.unwrap().unwrap();
        assert!(hit.password.is_empty());
        assert_eq!(hit.username, "ada");
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryUserCache::default();
        cache.set(&user(3), Duration::ZERO).await.unwrap();

        assert!(cache.get(3).await.unwrap().is_none());
    }

    #[test]
    fn test_user_key() {
        assert_eq!(user_key(42), "user-42");
    }
}
