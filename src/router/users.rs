//! Users-related HTTP API.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::product::{FeedProduct, FeedQuery};
use crate::router::Caller;
use crate::user::User;

/// Get an active identity, served from cache when possible.
pub async fn get(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path(user_id): Path<i64>,
) -> Result<Json<User>> {
    Ok(Json(state.users.get(user_id).await?))
}

/// Consume an activation token.
pub async fn activate(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode> {
    state.identity.activate(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Products feed of the caller.
pub async fn feed(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<FeedProduct>>> {
    query.validate()?;

    Ok(Json(state.storage.products.feed(caller.id, &query).await?))
}
