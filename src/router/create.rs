use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use validator::Validate;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;
use crate::user::{NewUser, User};

#[derive(Debug, Serialize, Deserialize, Validate, Zeroize, ZeroizeOnDrop)]
pub struct Body {
    #[validate(
        length(min = 1, max = 100),
        custom(
            function = "crate::router::validate_username",
            message = "Username must be alphanumeric."
        )
    )]
    pub username: String,
    #[validate(
        email(message = "Email must be formatted."),
        length(max = 255)
    )]
    pub email: String,
    #[validate(length(
        min = 3,
        max = 72,
        message = "Password must contain between 3 and 72 characters."
    ))]
    pub password: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub user: User,
    /// Plaintext activation token, only ever returned here.
    pub token: String,
}

/// Handler to provision an identity.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<Response>)> {
    let draft = NewUser::new(body.username.clone(), body.email.clone());
    let (user, token) = state.identity.provision(draft, &body.password).await?;

    Ok((StatusCode::CREATED, Json(Response { user, token })))
}
