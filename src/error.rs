use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

// ─── ApiError ───────────────────────────────────────────────────────────────

/// REST error carried to the client as a JSON envelope:
///
/// ```json
/// {
///   "error": {
///     "code": "username_taken",
///     "message": "Username 'alice' is already registered.",
///     "status": 409
///   }
/// }
/// ```
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        } else if self.status.is_client_error() {
            tracing::warn!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        ApiError::internal(format!("database error: {err}"))
    }
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    // Thin wrappers for the handful of generic HTTP outcomes handlers reach
    // for; the stable `code` doubles as the client-facing discriminant.

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", msg)
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// No usable bearer token in the request headers.
    pub fn auth_header_missing() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "auth_header_missing",
            "Expected an 'Authorization: Bearer <token>' header.",
        )
    }

    /// The bearer token failed signature or expiry validation.
    pub fn token_invalid() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "token_invalid",
            "The provided token is invalid or expired.",
        )
    }

    /// Registration collided with an existing account.
    pub fn username_taken(username: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "username_taken",
            format!("Username '{username}' is already registered."),
        )
    }

    /// The account authenticated but is still pending approval, or was
    /// rejected by an admin.
    pub fn account_not_active(status: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "account_not_active",
            format!("Account status is '{status}'."),
        )
    }
}

// ─── Socket ack envelopes ───────────────────────────────────────────────────

/// `{success: true}` merged with `extra`'s top-level fields.
pub fn ack_ok(extra: Value) -> Value {
    let mut body = json!({ "success": true });
    if let (Some(map), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    body
}

/// `{success: false, error}` — the only failure shape clients ever see.
pub fn ack_err(error: impl Into<String>) -> Value {
    json!({ "success": false, "error": error.into() })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Render an error through the axum response path and parse the JSON
    /// body back out.
    async fn response_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn envelope_shape() {
        let (status, body) = response_json(ApiError::username_taken("alice")).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "username_taken");
        assert_eq!(body["error"]["status"], 409);
        assert!(body["error"]["message"].as_str().unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn wrappers_carry_their_status() {
        let (status, body) = response_json(ApiError::unauthorized("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let (status, body) = response_json(ApiError::internal("boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "internal_server_error");
    }

    #[test]
    fn ack_envelopes() {
        let ok = ack_ok(json!({ "roomId": "r1" }));
        assert_eq!(ok["success"], true);
        assert_eq!(ok["roomId"], "r1");

        let err = ack_err("Cannot consume own producer");
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "Cannot consume own producer");
    }
}
