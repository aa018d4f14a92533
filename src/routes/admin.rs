use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth;
use crate::error::ApiError;
use crate::store;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<auth::Claims, ApiError> {
    let claims = auth::bearer_claims(headers, &state.config.jwt_secret)?;
    if claims.role != "admin" {
        return Err(ApiError::forbidden("admin role required"));
    }
    Ok(claims)
}

/// GET /api/admin/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;

    let limit = pagination.limit.unwrap_or(50).clamp(1, 200);
    let offset = pagination.offset.unwrap_or(0).max(0);

    let mut conn = state.db.get().map_err(|e| ApiError::internal(e.to_string()))?;
    let users = store::list_users(&mut conn, limit, offset)?;
    Ok(Json(json!({ "users": users, "limit": limit, "offset": offset })))
}

/// GET /api/admin/users/pending
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;

    let mut conn = state.db.get().map_err(|e| ApiError::internal(e.to_string()))?;
    let users = store::list_pending_users(&mut conn)?;
    Ok(Json(json!({ "users": users })))
}

/// POST /api/admin/users/:id/approve
pub async fn approve_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    transition(&state, &headers, user_id, "active").await
}

/// POST /api/admin/users/:id/reject
pub async fn reject_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    transition(&state, &headers, user_id, "rejected").await
}

async fn transition(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    user_id: Uuid,
    status: &str,
) -> Result<Json<Value>, ApiError> {
    let claims = require_admin(state, headers)?;

    let mut conn = state.db.get().map_err(|e| ApiError::internal(e.to_string()))?;
    let user = store::set_user_status(&mut conn, user_id, status)
        .map_err(|_| ApiError::not_found(format!("User '{user_id}' does not exist.")))?;

    tracing::info!(admin = %claims.sub, user_id = %user.id, status, "user status changed");
    Ok(Json(json!({ "user": user })))
}
