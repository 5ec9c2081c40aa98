use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::{Duration, OffsetDateTime};

use crate::{AppState, appresult::{AppError, AppResult}};

const TOKEN_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub enum Identity {
    User(CurrentUser),
    Anonymous,
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    pub fn user(&self) -> AppResult<&CurrentUser> {
        match self {
            Identity::User(user) => Ok(user),
            Identity::Anonymous => Err(AppError::Unauthorized),
        }
    }
}

/// Middleware wrapping every handshake: resolve whatever credential came
/// with the request and stash the identity in the request extensions.
/// Anonymous passes through; each handler decides whether that is enough.
pub async fn gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = extract_token(request.headers(), request.uri().query());
    let identity = authenticate(&state.db_pool, &state.config.jwt_secret, token.as_deref()).await;
    request.extensions_mut().insert(identity);
    next.run(request).await
}

// Authorization header takes precedence over the ?token= query parameter.
pub(crate) fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim().to_owned());
        }
    }

    query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_owned)
}

/// Resolves a credential to an identity. Missing, malformed, expired and
/// forged tokens all degrade to `Anonymous`; this never fails the handshake.
pub async fn authenticate(db_pool: &SqlitePool, secret: &str, token: Option<&str>) -> Identity {
    let Some(token) = token else {
        return Identity::Anonymous;
    };

    let key = DecodingKey::from_secret(secret.as_bytes());
    let claims = match decode::<Claims>(token, &key, &Validation::default()) {
        Ok(data) => data.claims,
        Err(_) => return Identity::Anonymous,
    };

    let row: Option<(i64, String, String)> =
        sqlx::query_as("SELECT id,username,role FROM users WHERE id=?")
            .bind(claims.user_id)
            .fetch_optional(db_pool)
            .await
            .ok()
            .flatten();

    match row {
        Some((id, username, role)) => Identity::User(CurrentUser { id, username, role }),
        None => Identity::Anonymous,
    }
}

/// Mints an access token for a user, for the account subsystem and tests.
pub fn issue_token(user_id: i64, secret: &str) -> anyhow::Result<String> {
    let exp = (OffsetDateTime::now_utc() + Duration::minutes(TOKEN_TTL_MINUTES)).unix_timestamp();
    let claims = Claims { user_id, exp };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}
