//! Request authentication.
//!
//! Sessions are HS256 JWTs under the shared `JWT_SECRET`; `AUTH_DISABLED`
//! mints the "dev" user for local runs. `ADMIN_EMAILS` grants the ADMIN
//! role at first sight of the user. Internal endpoints check
//! `X-Internal-Token` against `INTERNAL_API_SECRET` in constant time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::api::AppState;
use crate::db::Database;
use crate::models::{User, UserRole};

const DEV_USER_EMAIL: &str = "dev@local";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub email: String,
    /// Unix expiry.
    pub exp: i64,
}

type HmacSha256 = Hmac<Sha256>;

/// Mint an HS256 session token.
pub fn sign_token(secret: &str, user_id: i64, email: &str, ttl_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
    let signing_input = format!("{header}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{signature}")
}

/// Verify a session token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let (header, payload, signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let signing_input = format!("{header}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(signing_input.as_bytes());
    let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        return None;
    }

    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
    if claims.exp < chrono::Utc::now().timestamp() {
        return None;
    }
    Some(claims)
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn cookie_token(request: &Request) -> Option<String> {
    let cookies = request.headers().get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "session").then(|| value.to_string())
    })
}

/// Role a fresh user gets, honoring ADMIN_EMAILS.
fn role_for(state: &AppState, email: &str) -> UserRole {
    if state.config.admin_emails.iter().any(|e| e == email) {
        UserRole::Admin
    } else {
        UserRole::User
    }
}

async fn get_or_create_user(state: &AppState, email: &str) -> Result<User, StatusCode> {
    if let Some(user) = state
        .db
        .get_user_by_email(email)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    {
        return Ok(user);
    }
    state
        .db
        .create_user(email, None, role_for(state, email))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Authenticates the request and stashes the `User` in extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let user = if state.config.auth_disabled {
        get_or_create_user(&state, DEV_USER_EMAIL).await?
    } else {
        let secret = state
            .config
            .jwt_secret
            .as_ref()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
        let token = bearer_token(&request)
            .map(str::to_string)
            .or_else(|| cookie_token(&request))
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let claims =
            verify_token(secret.expose_secret(), &token).ok_or(StatusCode::UNAUTHORIZED)?;

        // Single-tenant installs pin the permitted principal.
        if state.config.single_tenant {
            let permitted = state
                .config
                .owner_email
                .as_deref()
                .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
            if !claims.email.eq_ignore_ascii_case(permitted) {
                return Err(StatusCode::FORBIDDEN);
            }
        }

        get_or_create_user(&state, &claims.email).await?
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Gate for /internal routes: shared-secret header, compared constant-time.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let configured = state
        .config
        .internal_api_secret
        .as_ref()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    let presented = request
        .headers()
        .get("x-internal-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let matches: bool = presented
        .as_bytes()
        .ct_eq(configured.expose_secret().as_bytes())
        .into();
    if !matches {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

/// Owner check helper: admins see everything.
pub fn require_owner(user: &User, owner_id: i64) -> Result<(), crate::api::ApiError> {
    if user.is_admin() || user.id == owner_id {
        Ok(())
    } else {
        Err(crate::api::ApiError::permission_denied())
    }
}

/// Owner scope for listing endpoints: None (all rows) for admins.
pub fn listing_scope(user: &User) -> Option<i64> {
    if user.is_admin() { None } else { Some(user.id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = sign_token("secret", 7, "a@b.c", 3600);
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.email, "a@b.c");
    }

    #[test]
    fn bad_signature_rejected() {
        let token = sign_token("secret", 7, "a@b.c", 3600);
        assert!(verify_token("other-secret", &token).is_none());

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(verify_token("secret", &tampered).is_none());
    }

    #[test]
    fn expired_token_rejected() {
        let token = sign_token("secret", 7, "a@b.c", -10);
        assert!(verify_token("secret", &token).is_none());
    }

    #[test]
    fn owner_check_lets_admins_through() {
        let admin = User {
            id: 1,
            email: "admin@x.y".to_string(),
            role: UserRole::Admin,
            provider: None,
            created_at: chrono::Utc::now(),
        };
        let user = User {
            id: 2,
            role: UserRole::User,
            ..admin.clone()
        };
        assert!(require_owner(&admin, 99).is_ok());
        assert!(require_owner(&user, 2).is_ok());
        assert!(require_owner(&user, 99).is_err());
        assert_eq!(listing_scope(&admin), None);
        assert_eq!(listing_scope(&user), Some(2));
    }
}
