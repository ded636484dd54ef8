//! Liveness and metrics endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Structured health.
#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    pub env: String,
    pub version: String,
}

/// Public server health.
pub async fn health(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        status: "ok".into(),
        env: state.config.env.to_string(),
        version: state.config.version().to_owned(),
    })
}

/// Prometheus exposition, when a recorder is installed.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::*;
    use crate::router::tests::{body, state};
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_health_handler() {
        let app = app(state());

        let response =
            make_request(None, app.clone(), Method::GET, "/v1/healthz", String::default())
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let status: Status = body(response).await;
        assert_eq!(status.status, "ok");
        assert_eq!(status.env, "development");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

        let response =
            make_request(None, app, Method::GET, "/metrics", String::default()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
