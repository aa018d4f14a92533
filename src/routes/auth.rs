use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth;
use crate::error::ApiError;
use crate::store;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.username.trim().is_empty() || req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("username, email and password are required"));
    }

    let password_hash = auth::hash_password(&req.password)?;
    let mut conn = state.db.get().map_err(|e| ApiError::internal(e.to_string()))?;

    if store::username_or_email_exists(&mut conn, &req.username, &req.email)? {
        return Err(ApiError::username_taken(&req.username));
    }

    let user = store::create_user(&mut conn, &req.username, &req.email, &password_hash)?;
    let token = auth::create_token(
        user.id,
        &user.username,
        &user.role,
        &state.config.jwt_secret,
        state.config.jwt_expires_secs,
    )?;

    tracing::info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(Json(json!({ "user": user, "token": token })))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.db.get().map_err(|e| ApiError::internal(e.to_string()))?;

    let user = store::find_user_by_username(&mut conn, &req.username)?
        .ok_or_else(|| ApiError::unauthorized("invalid username or password"))?;

    if !auth::verify_password(&req.password, &user.password_hash)? {
        return Err(ApiError::unauthorized("invalid username or password"));
    }

    // Pending and rejected accounts authenticate but may not enter.
    if user.status != "active" {
        return Err(ApiError::account_not_active(&user.status));
    }

    let token = auth::create_token(
        user.id,
        &user.username,
        &user.role,
        &state.config.jwt_secret,
        state.config.jwt_expires_secs,
    )?;

    tracing::info!(user_id = %user.id, "user logged in");
    Ok(Json(json!({ "user": user, "token": token })))
}
