//! Products-related HTTP API.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::AppState;
use crate::authz::{ADMIN, MODERATOR};
use crate::error::Result;
use crate::product::{MAX_CATEGORIES, Product, Review};
use crate::router::{Caller, Valid};

fn validate_price(price: f64) -> std::result::Result<(), ValidationError> {
    if price > 0.0 && price.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("price_must_be_positive"))
    }
}

fn validate_categories(categories: &[String]) -> std::result::Result<(), ValidationError> {
    if categories.is_empty() || categories.len() > MAX_CATEGORIES {
        return Err(ValidationError::new("between_one_and_five_categories"));
    }
    if categories.iter().any(|c| c.trim().is_empty() || c.len() > 100) {
        return Err(ValidationError::new("invalid_category"));
    }

    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateBody {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(custom(function = "validate_price"))]
    pub price: f64,
    #[validate(length(max = 1000))]
    pub description: String,
    #[validate(custom(function = "validate_categories"))]
    pub categories: Vec<String>,
}

/// Partial update. `version` pins the snapshot the client edited.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateBody {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[validate(custom(function = "validate_price"))]
    pub price: Option<f64>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(custom(function = "validate_categories"))]
    pub categories: Option<Vec<String>>,
    pub version: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ReviewBody {
    #[validate(range(min = 1, max = 5))]
    pub rating: i32,
    #[validate(length(max = 1000))]
    pub comment: String,
}

/// List a product owned by the caller.
pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Valid(body): Valid<CreateBody>,
) -> Result<(StatusCode, Json<Product>)> {
    let mut product = Product {
        user_id: caller.id,
        name: body.name,
        price: body.price,
        description: body.description,
        categories: body.categories,
        ..Default::default()
    };
    state.storage.products.create(&mut product).await?;

    tracing::info!(product_id = product.id, user_id = caller.id, "product created");

    Ok((StatusCode::CREATED, Json(product)))
}

/// Get a product with its reviews.
pub async fn get(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
) -> Result<Json<Product>> {
    let mut product = state.storage.products.get_by_id(product_id).await?;
    product.reviews = state.storage.reviews.get_by_product_id(product_id).await?;

    Ok(Json(product))
}

/// Patch a product. Owner or moderator only.
pub async fn update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(product_id): Path<i64>,
    Valid(body): Valid<UpdateBody>,
) -> Result<Json<Product>> {
    let mut product = state.storage.products.get_by_id(product_id).await?;
    state
        .authz
        .require(&caller, product.user_id, MODERATOR)
        .await?;

    if let Some(name) = body.name {
        product.name = name;
    }
    if let Some(price) = body.price {
        product.price = price;
    }
    if let Some(description) = body.description {
        product.description = description;
    }
    if let Some(categories) = body.categories {
        product.categories = categories;
    }
    if let Some(version) = body.version {
        product.version = version;
    }

    state.storage.products.update(&mut product).await?;

    Ok(Json(product))
}

/// Delete a product. Owner or admin only.
pub async fn delete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(product_id): Path<i64>,
) -> Result<StatusCode> {
    let product = state.storage.products.get_by_id(product_id).await?;
    state.authz.require(&caller, product.user_id, ADMIN).await?;

    state.storage.products.delete(product_id).await?;
    tracing::info!(product_id, user_id = caller.id, "product deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// Review a product.
pub async fn review(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(product_id): Path<i64>,
    Valid(body): Valid<ReviewBody>,
) -> Result<(StatusCode, Json<Review>)> {
    let mut review = Review {
        product_id,
        user_id: caller.id,
        rating: body.rating,
        comment: body.comment,
        ..Default::default()
    };
    state.storage.reviews.create(&mut review).await?;

    Ok((StatusCode::CREATED, Json(review)))
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::router::tests::{body, signup, state};
    use crate::user::NewUser;
    use crate::{app, make_request};

    async fn list(app: &Router, token: &str) -> Product {
        let response = make_request(
            Some(token),
            app.clone(),
            Method::POST,
            "/v1/products",
            json!({
                "name": "Lamp",
                "price": 12.5,
                "description": "A desk lamp",
                "categories": ["home", "light"],
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body(response).await
    }

    /// Identity with `role`, activated and logged in.
    async fn privileged(state: &AppState, app: &Router, role: &str) -> String {
        let (user, token) = state
            .identity
            .provision(
                NewUser::new(role, format!("{role}@digitally.shop")).role(role),
                "password",
            )
            .await
            .unwrap();
        state.identity.activate(&token).await.unwrap();
        assert_eq!(state.storage.users.get_by_id(user.id).await.unwrap().role.name, role);

        let response = make_request(
            None,
            app.clone(),
            Method::POST,
            "/v1/authentication/token",
            json!({ "email": format!("{role}@digitally.shop"), "password": "password" })
                .to_string(),
        )
        .await;
        let login: crate::router::login::Response = body(response).await;
        login.token
    }

    #[test]
    fn test_price_rules() {
        assert!(validate_price(12.5).is_ok());
        assert!(validate_price(0.0).is_err());
        assert!(validate_price(-1.0).is_err());
        assert!(validate_price(f64::INFINITY).is_err());

        let patch = UpdateBody {
            price: Some(-3.0),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
        assert!(UpdateBody::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let app = app(state());
        let (ada, token) = signup(&app, "ada").await;

        let product = list(&app, &token).await;
        assert_eq!(product.user_id, ada);
        assert_eq!(product.version, 0);

        let response = make_request(
            Some(&token),
            app.clone(),
            Method::POST,
            &format!("/v1/products/{}/reviews", product.id),
            json!({ "rating": 5, "comment": "bright" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = make_request(
            None,
            app.clone(),
            Method::GET,
            &format!("/v1/products/{}", product.id),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: Product = body(response).await;
        assert_eq!(fetched.reviews.len(), 1);
        assert_eq!(fetched.reviews[0].username, "ada");

        let response = make_request(
            None,
            app,
            Method::GET,
            "/v1/products/404",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_product() {
        let app = app(state());
        let (_, token) = signup(&app, "ada").await;

        for body in [
            json!({ "name": "Lamp", "price": 0.0, "description": "", "categories": ["home"] }),
            json!({ "name": "Lamp", "price": 1.0, "description": "", "categories": [] }),
            json!({ "name": "", "price": 1.0, "description": "", "categories": ["home"] }),
            json!({
                "name": "Lamp",
                "price": 1.0,
                "description": "",
                "categories": ["a", "b", "c", "d", "e", "f"],
            }),
        ] {
            let response = make_request(
                Some(&token),
                app.clone(),
                Method::POST,
                "/v1/products",
                body.to_string(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn test_update_rules() {
        let state = state();
        let app = app(state.clone());
        let (_, owner) = signup(&app, "ada").await;
        let (_, stranger) = signup(&app, "grace").await;
        let moderator = privileged(&state, &app, "moderator").await;
        let product = list(&app, &owner).await;
        let path = format!("/v1/products/{}", product.id);

        let response = make_request(
            Some(&stranger),
            app.clone(),
            Method::PATCH,
            &path,
            json!({ "name": "Stolen" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = make_request(
            Some(&owner),
            app.clone(),
            Method::PATCH,
            &path,
            json!({ "name": "Desk lamp", "version": 0 }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Product = body(response).await;
        assert_eq!(updated.version, 1);
        assert_eq!(updated.price, 12.5);

        // stale snapshot.
        let response = make_request(
            Some(&moderator),
            app.clone(),
            Method::PATCH,
            &path,
            json!({ "price": 9.0, "version": 0 }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = make_request(
            Some(&moderator),
            app,
            Method::PATCH,
            &path,
            json!({ "price": 9.0 }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Product = body(response).await;
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "Desk lamp");
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let state = state();
        let app = app(state.clone());
        let (_, owner) = signup(&app, "ada").await;
        let moderator = privileged(&state, &app, "moderator").await;
        let admin = privileged(&state, &app, "admin").await;

        let first = list(&app, &owner).await;
        let second = list(&app, &owner).await;

        let response = make_request(
            Some(&moderator),
            app.clone(),
            Method::DELETE,
            &format!("/v1/products/{}", first.id),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        for (token, product) in [(&admin, &first), (&owner, &second)] {
            let response = make_request(
                Some(token),
                app.clone(),
                Method::DELETE,
                &format!("/v1/products/{}", product.id),
                String::default(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = make_request(
            Some(&owner),
            app,
            Method::DELETE,
            &format!("/v1/products/{}", first.id),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
