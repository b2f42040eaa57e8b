/// Session authentication and Origin checks
use crate::{
    account::User,
    context::AppContext,
    error::{AppError, AppResult},
};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use axum_extra::extract::CookieJar;

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Session token from the session cookie, falling back to a bearer token
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| extract_bearer_token(headers))
}

/// Resolve the request's session to a user or fail with 401
pub async fn require_user(ctx: &AppContext, headers: &HeaderMap) -> AppResult<User> {
    let token = session_token(headers, &ctx.config.service.session_cookie_name)
        .ok_or_else(|| AppError::Authentication("Missing session".to_string()))?;

    ctx.accounts
        .session_user(&token)
        .await?
        .ok_or_else(|| AppError::Authentication("Invalid session".to_string()))
}

/// Authenticated family member
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, ctx: &AppContext) -> Result<Self, Self::Rejection> {
        require_user(ctx, &parts.headers).await.map(AuthUser)
    }
}

/// Accept requests without an Origin header or with an allow-listed one
pub fn check_origin(headers: &HeaderMap, allowed: &[String]) -> AppResult<()> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };

    let origin = origin
        .to_str()
        .map_err(|_| AppError::Forbidden("Malformed Origin header".to_string()))?;

    if allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        Ok(())
    } else {
        tracing::warn!(origin, "Rejected WebSocket origin");
        Err(AppError::Forbidden(format!("Origin not allowed: {}", origin)))
    }
}
