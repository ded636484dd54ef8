//! HTTP API.
pub mod create;
pub mod login;
pub mod products;
pub mod status;
pub mod users;
pub mod wishlist;

use std::sync::LazyLock;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::header;
use axum::http::request::Parts;
use regex_lite::Regex;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError};

use crate::AppState;
use crate::error::ServerError;
use crate::user::User;

const BEARER: &str = "Bearer ";

static USERNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("username pattern is valid")
});

/// Check that a username only holds letters, digits, `_` and `-`.
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if USERNAME.is_match(username) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_username"))
    }
}

/// JSON body checked with [`Validate`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Active identity behind the bearer token.
#[derive(Debug, Clone)]
pub struct Caller(pub User);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix(BEARER))
            .ok_or(ServerError::Unauthorized)?;
        let claims = state.token.decode(token)?;

        match state.users.get(claims.sub).await {
            Ok(user) => Ok(Caller(user)),
            Err(ServerError::NotFound) => Err(ServerError::Unauthorized),
            Err(err) => {
                tracing::warn!(user_id = claims.sub, error = %err, "cannot resolve caller");
                Err(ServerError::Unauthorized)
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde_json::json;

    use super::*;
    use crate::config::{Configuration, Token};
    use crate::database::Storage;
    use crate::mail::tests::RecordingMailer;
    use crate::user::MemoryUserCache;
    use crate::{app, make_request};

    /// Configuration with a known secret and fast hashing.
    pub fn config() -> Configuration {
        let mut config = Configuration::default();
        config.token = Token {
            secret: "test-secret".into(),
            ..Default::default()
        };
        config.argon2 = Some(crate::crypto::fast_argon2());
        config
    }

    /// State over in-memory storage and cache.
    pub fn state() -> AppState {
        state_with(config(), Arc::new(RecordingMailer::default()))
    }

    pub fn state_with(config: Configuration, mailer: Arc<RecordingMailer>) -> AppState {
        AppState::new(
            Arc::new(config),
            Storage::memory(),
            Some(Arc::new(MemoryUserCache::default())),
            mailer,
            None,
        )
        .unwrap()
    }

    pub async fn body<T: DeserializeOwned>(
        response: axum::http::Response<axum::body::Body>,
    ) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Register, activate and log in `username`. Returns its id and JWT.
    pub async fn signup(app: &Router, username: &str) -> (i64, String) {
        let email = format!("{username}@digitally.shop");
        let response = make_request(
            None,
            app.clone(),
            Method::POST,
            "/v1/authentication/user",
            json!({ "username": username, "email": email, "password": "password" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: crate::router::create::Response = body(response).await;

        let response = make_request(
            None,
            app.clone(),
            Method::PUT,
            &format!("/v1/users/activate/{}", created.token),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            None,
            app.clone(),
            Method::POST,
            "/v1/authentication/token",
            json!({ "email": email, "password": "password" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let login: crate::router::login::Response = body(response).await;

        (created.user.id, login.token)
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("ada_lovelace-1").is_ok());
        assert!(validate_username("ada lovelace").is_err());
        assert!(validate_username("ada@home").is_err());
    }

    #[tokio::test]
    async fn test_caller_requires_bearer() {
        let state = state();
        let app = app(state.clone());
        let (id, _) = signup(&app, "ada").await;
        let path = format!("/v1/users/{id}");

        let response =
            make_request(None, app.clone(), Method::GET, &path, String::default()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            Some("not-a-jwt"),
            app.clone(),
            Method::GET,
            &path,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // valid signature, no identity behind it.
        let orphan = state.token.create(404).unwrap();
        let response =
            make_request(Some(&orphan), app, Method::GET, &path, String::default()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
