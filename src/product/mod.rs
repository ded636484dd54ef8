mod repository;

pub use repository::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub const MAX_CATEGORIES: usize = 5;
pub const MAX_FEED_LIMIT: i64 = 20;

/// Product listed by an identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub price: f64,
    pub description: String,
    pub categories: Vec<String>,
    /// Incremented on every successful update.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviews: Vec<Review>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Review {
    pub id: i64,
    pub product_id: i64,
    pub user_id: i64,
    /// Reviewer username.
    pub username: String,
    pub rating: i32,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Product as listed on a feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedProduct {
    #[serde(flatten)]
    pub product: Product,
    pub seller: String,
    pub review_count: i64,
    pub is_wishlisted: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    Asc,
    #[default]
    Desc,
}

impl Sort {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Sort::Asc => "ASC",
            Sort::Desc => "DESC",
        }
    }
}

/// Paginated and filtered feed request.
#[derive(Clone, Debug, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct FeedQuery {
    #[validate(range(min = 1, max = 20))]
    pub limit: i64,
    #[validate(range(min = 0))]
    pub offset: i64,
    pub sort: Sort,
    #[validate(length(max = 100))]
    pub search: Option<String>,
    /// Comma separated.
    #[validate(custom(function = "validate_categories"))]
    pub categories: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            limit: MAX_FEED_LIMIT,
            offset: 0,
            sort: Sort::default(),
            search: None,
            categories: None,
            since: None,
            until: None,
        }
    }
}

impl FeedQuery {
    /// Requested categories, blanks removed.
    pub fn categories(&self) -> Vec<String> {
        self.categories
            .as_deref()
            .map(split_categories)
            .unwrap_or_default()
    }

    /// Non-empty search term.
    pub fn search(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

fn split_categories(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

fn validate_categories(raw: &str) -> Result<(), ValidationError> {
    if split_categories(raw).len() > MAX_CATEGORIES {
        return Err(ValidationError::new("too_many_categories"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_query_defaults() {
        let query: FeedQuery = serde_json::from_str("{}").unwrap();

        assert_eq!(query.limit, 20);
        assert_eq!(query.offset, 0);
        assert_eq!(query.sort, Sort::Desc);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_feed_query_bounds() {
        let query = FeedQuery {
            limit: 21,
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = FeedQuery {
            offset: -1,
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = FeedQuery {
            categories: Some("a,b,c,d,e,f".into()),
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = FeedQuery {
            categories: Some(" a, ,b ".into()),
            ..Default::default()
        };
        assert!(query.validate().is_ok());
        assert_eq!(query.categories(), ["a", "b"]);
    }
}
