//! User registration and listing endpoints.

use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use relay_core::Registration;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Reply sent when the username is already registered.
pub const ALREADY_REGISTERED: &str = "INGRESO CORRECTAMENTE.";

/// Body of `POST /register`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub real_name: String,
}

/// Register a user, or acknowledge an existing one.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    let username = request.username.trim();
    if username.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "username must not be empty" })),
        );
    }

    match state
        .relay
        .store()
        .register_user(username, &request.real_name)
        .await
    {
        Ok(Registration::Existing(_)) => {
            (StatusCode::OK, Json(json!({ "ms": ALREADY_REGISTERED })))
        }
        Ok(Registration::Created(user)) => {
            info!(id = user.id, username = %user.user_name, "User registered");
            (StatusCode::OK, Json(json!(user)))
        }
        Err(e) => {
            error!(username = %username, error = %e, "Registration failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// List every registered user.
pub async fn list_users(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.relay.store().list_users().await {
        Ok(users) => (StatusCode::OK, Json(json!(users))),
        Err(e) => {
            error!(error = %e, "Listing users failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// List every registered username.
pub async fn list_usernames(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.relay.store().list_users().await {
        Ok(users) => {
            let names: Vec<String> = users.into_iter().map(|user| user.user_name).collect();
            (StatusCode::OK, Json(json!(names)))
        }
        Err(e) => {
            error!(error = %e, "Listing usernames failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
