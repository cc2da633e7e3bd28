use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    sub: i32,
    /// Identity-provider organization id of the active tenant.
    org: String,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated caller. Identity itself is issued elsewhere; this only checks the token.
pub struct AuthUser {
    pub user_id: i32,
    pub organization_external_id: String,
    pub role: String,
}

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
        let cookies = cookie_header.to_str().unwrap_or("");
        let from_cookie = cookies.split(';').find_map(|c| {
            let c = c.trim();
            c.strip_prefix("auth_token=").map(|s| s.to_string())
        });
        if from_cookie.is_some() {
            return from_cookie;
        }
    }
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|authz| authz.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token =
            token_from_parts(parts).ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        if decoded.claims.org.trim().is_empty() {
            return Err((StatusCode::FORBIDDEN, "No active organization".into()));
        }
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            organization_external_id: decoded.claims.org,
            role: decoded.claims.role,
        })
    }
}
