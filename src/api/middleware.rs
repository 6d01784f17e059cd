//! API Middleware - Authentication
//!
//! HS256 bearer tokens carrying the user id in `sub`. The WebSocket route
//! is skipped here and authenticates from its `token` query parameter —
//! the upgrade happens before auth headers are usable from browsers.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::presence::UserId;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Authenticated identity extracted by the middleware.
#[derive(Clone, Copy, Debug)]
pub struct AuthUser(pub UserId);

fn jwt_secret() -> String {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| "default_secret_do_not_use_in_prod".to_string())
}

/// Validate a token and extract the user id from `sub`.
pub fn decode_user_token(token: &str) -> Result<UserId, StatusCode> {
    let key = DecodingKey::from_secret(jwt_secret().as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &key, &validation).map_err(|_| StatusCode::UNAUTHORIZED)?;
    data.claims
        .sub
        .parse::<UserId>()
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

/// Mint a token for a user; used by the token subcommand and by tests.
pub fn issue_token(user_id: UserId, ttl_secs: u64) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() as u64 + ttl_secs) as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
}

pub async fn auth_middleware(mut request: Request, next: Next) -> Result<Response, StatusCode> {
    let path = request.uri().path();

    let public_paths = ["/health", "/metrics"];
    if public_paths.contains(&path) || path.starts_with("/ws/") {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") => {
            let user_id = decode_user_token(&auth[7..])?;
            request.extensions_mut().insert(AuthUser(user_id));
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
