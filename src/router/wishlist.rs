//! Wishlist HTTP API.

use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::AppState;
use crate::error::Result;
use crate::router::Caller;

/// Save a product on the caller wishlist.
pub async fn add(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(product_id): Path<i64>,
) -> Result<StatusCode> {
    state.storage.products.get_by_id(product_id).await?;
    state.storage.wishlist.add(caller.id, product_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Remove a product from the caller wishlist.
pub async fn remove(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(product_id): Path<i64>,
) -> Result<StatusCode> {
    state.storage.products.get_by_id(product_id).await?;
    state.storage.wishlist.remove(caller.id, product_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
