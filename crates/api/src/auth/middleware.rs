//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::state::AppState;

/// Authenticated caller extracted from the bearer JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid internal credential")]
    InvalidSecret,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InvalidSecret => (StatusCode::UNAUTHORIZED, "Invalid credential"),
        };

        let body = Json(json!({
            "error": "unauthorized",
            "message": message,
        }));

        (status, body).into_response()
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid user JWT
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => state
            .jwt
            .validate(token)
            .map(|claims| AuthUser {
                user_id: claims.sub,
                email: claims.email,
            })
            .map_err(|e| {
                tracing::debug!(path = %path, error = %e, "require_auth: token rejected");
                AuthError::InvalidToken
            }),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(path = %path, user_id = %auth_user.user_id, "require_auth: authenticated");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware for scheduler and operator endpoints: shared-secret bearer,
/// compared in constant time
pub async fn require_internal_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(presented) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "Internal endpoint called without credential");
        return AuthError::MissingAuth.into_response();
    };

    let expected = state.config.retry_drain_secret.as_bytes();
    if !bool::from(presented.as_bytes().ct_eq(expected)) {
        tracing::warn!(path = %path, "Internal endpoint called with wrong credential");
        return AuthError::InvalidSecret.into_response();
    }

    next.run(request).await
}
