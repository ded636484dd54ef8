//! Volatile storage, one lock around every table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::authz::RoleStore;
use crate::error::{Result, ServerError};
use crate::product::{FeedProduct, FeedQuery, Product, ProductStore, Review, ReviewStore, Sort};
use crate::user::{Invitation, Role, User, UserStore};
use crate::wishlist::WishlistStore;

#[derive(Default)]
struct Tables {
    roles: Vec<Role>,
    users: BTreeMap<i64, User>,
    /// Keyed by token digest.
    invitations: HashMap<String, Invitation>,
    products: BTreeMap<i64, Product>,
    reviews: BTreeMap<i64, Review>,
    wishlist: BTreeSet<(i64, i64)>,
    sequence: i64,
    fail_deletes: bool,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|role| role.name == name)
    }
}

/// In-memory implementation of every store.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let roles = [
            ("user", 1, "A user can create products and reviews"),
            ("moderator", 2, "A moderator can update other users products"),
            ("admin", 3, "An admin can update and delete other users products"),
        ]
        .into_iter()
        .enumerate()
        .map(|(index, (name, level, description))| Role {
            id: index as i64 + 1,
            name: name.into(),
            level,
            description: description.into(),
        })
        .collect();

        Self {
            tables: Mutex::new(Tables {
                roles,
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn invitation_count(&self) -> usize {
        self.tables.lock().await.invitations.len()
    }

    pub async fn has_invitation(&self, token_hash: &str) -> bool {
        self.tables.lock().await.invitations.contains_key(token_hash)
    }

    /// Make every identity deletion fail.
    pub async fn fail_deletes(&self, fail: bool) {
        self.tables.lock().await.fail_deletes = fail;
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_and_invite(
        &self,
        user: &mut User,
        invitation_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;

        let role = tables
            .role(&user.role.name)
            .cloned()
            .ok_or_else(|| ServerError::Internal {
                details: format!("role `{}` is not configured", user.role.name),
                source: None,
            })?;
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(ServerError::DuplicateEmail);
        }
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(ServerError::DuplicateUsername);
        }
        if tables.invitations.contains_key(invitation_hash) {
            return Err(ServerError::Internal {
                details: "invitation token collision".into(),
                source: None,
            });
        }

        let now = Utc::now();
        user.id = tables.next_id();
        user.role = role;
        user.is_active = false;
        user.created_at = now;
        user.updated_at = now;

        tables.users.insert(user.id, user.clone());
        tables.invitations.insert(
            invitation_hash.to_owned(),
            Invitation {
                user_id: user.id,
                token_hash: invitation_hash.to_owned(),
                expiry,
            },
        );

        Ok(())
    }

    async fn activate(&self, invitation_hash: &str) -> Result<i64> {
        let mut tables = self.tables.lock().await;

        let user_id = match tables.invitations.get(invitation_hash) {
            Some(invitation) if invitation.expiry > Utc::now() => invitation.user_id,
            _ => return Err(ServerError::NotFound),
        };
        let user = tables.users.get_mut(&user_id).ok_or(ServerError::NotFound)?;
        user.is_active = true;
        user.updated_at = Utc::now();

        tables.invitations.retain(|_, invitation| invitation.user_id != user_id);

        Ok(user_id)
    }

    async fn get_by_id(&self, id: i64) -> Result<User> {
        self.tables
            .lock()
            .await
            .users
            .get(&id)
            .filter(|user| user.is_active)
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User> {
        self.tables
            .lock()
            .await
            .users
            .values()
            .find(|user| user.is_active && user.email == email)
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if tables.fail_deletes {
            return Err(ServerError::Internal {
                details: "storage unavailable".into(),
                source: None,
            });
        }
        if tables.users.remove(&id).is_none() {
            return Err(ServerError::NotFound);
        }
        tables.invitations.retain(|_, invitation| invitation.user_id != id);

        // same cascade as the foreign keys.
        let listed: BTreeSet<i64> = tables
            .products
            .values()
            .filter(|product| product.user_id == id)
            .map(|product| product.id)
            .collect();
        tables.products.retain(|product_id, _| !listed.contains(product_id));
        tables.reviews.retain(|_, review| {
            review.user_id != id && !listed.contains(&review.product_id)
        });
        tables.wishlist.retain(|(user_id, product_id)| {
            *user_id != id && !listed.contains(product_id)
        });

        Ok(())
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn create(&self, product: &mut Product) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if !tables.users.contains_key(&product.user_id) {
            return Err(ServerError::NotFound);
        }

        let now = Utc::now();
        product.id = tables.next_id();
        product.version = 0;
        product.created_at = now;
        product.updated_at = now;
        product.reviews.clear();

        tables.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Product> {
        self.tables
            .lock()
            .await
            .products
            .get(&id)
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    async fn update(&self, product: &mut Product) -> Result<()> {
        let mut tables = self.tables.lock().await;

        let stored = tables.products.get_mut(&product.id).ok_or(ServerError::NotFound)?;
        if stored.version != product.version {
            metrics::counter!("edit_conflicts_total").increment(1);
            return Err(ServerError::EditConflict);
        }

        stored.name = product.name.clone();
        stored.price = product.price;
        stored.description = product.description.clone();
        stored.categories = product.categories.clone();
        stored.version += 1;
        stored.updated_at = Utc::now();

        product.version = stored.version;
        product.updated_at = stored.updated_at;

        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if tables.products.remove(&id).is_none() {
            return Err(ServerError::NotFound);
        }
        tables.reviews.retain(|_, review| review.product_id != id);
        tables.wishlist.retain(|(_, product_id)| *product_id != id);

        Ok(())
    }

    async fn feed(&self, user_id: i64, query: &FeedQuery) -> Result<Vec<FeedProduct>> {
        let tables = self.tables.lock().await;
        let search = query.search().map(str::to_lowercase);
        let categories = query.categories();

        let mut feed: Vec<FeedProduct> = tables
            .products
            .values()
            .filter(|p| {
                search.as_ref().is_none_or(|s| {
                    p.name.to_lowercase().contains(s)
                        || p.description.to_lowercase().contains(s)
                })
            })
            .filter(|p| {
                categories.is_empty() || p.categories.iter().any(|c| categories.contains(c))
            })
            .filter(|p| query.since.is_none_or(|since| p.created_at >= since))
            .filter(|p| query.until.is_none_or(|until| p.created_at <= until))
            .filter_map(|p| {
                let seller = tables.users.get(&p.user_id)?;
                Some(FeedProduct {
                    product: p.clone(),
                    seller: seller.username.clone(),
                    review_count: tables
                        .reviews
                        .values()
                        .filter(|r| r.product_id == p.id)
                        .count() as i64,
                    is_wishlisted: tables.wishlist.contains(&(user_id, p.id)),
                })
            })
            .collect();

        feed.sort_by_key(|f| (f.product.created_at, f.product.id));
        if query.sort == Sort::Desc {
            feed.reverse();
        }

        Ok(feed
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn create(&self, review: &mut Review) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if !tables.products.contains_key(&review.product_id) {
            return Err(ServerError::NotFound);
        }

        review.id = tables.next_id();
        review.username = tables
            .users
            .get(&review.user_id)
            .map(|user| user.username.clone())
            .ok_or(ServerError::NotFound)?;
        review.created_at = Utc::now();
        tables.reviews.insert(review.id, review.clone());

        Ok(())
    }

    async fn get_by_product_id(&self, product_id: i64) -> Result<Vec<Review>> {
        let tables = self.tables.lock().await;

        // ids grow with time, newest first.
        Ok(tables
            .reviews
            .values()
            .rev()
            .filter(|review| review.product_id == product_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WishlistStore for MemoryStore {
    async fn add(&self, user_id: i64, product_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if !tables.products.contains_key(&product_id) {
            return Err(ServerError::NotFound);
        }
        if !tables.wishlist.insert((user_id, product_id)) {
            return Err(ServerError::Conflict);
        }

        Ok(())
    }

    async fn remove(&self, user_id: i64, product_id: i64) -> Result<()> {
        self.tables.lock().await.wishlist.remove(&(user_id, product_id));
        Ok(())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn get_by_name(&self, name: &str) -> Result<Role> {
        self.tables
            .lock()
            .await
            .role(name)
            .cloned()
            .ok_or(ServerError::NotFound)
    }
}
