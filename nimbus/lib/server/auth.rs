use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::{config::DEFAULT_TEAM, NimbusError, NimbusResult};

use super::{ApiError, ServerState};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix of API keys handed to clients.
pub const API_KEY_PREFIX: &str = "nmb_";

/// The header naming the team when the server runs without a key.
pub const TEAM_HEADER: &str = "x-nimbus-team";

/// Base64 of `{"typ":"JWT","alg":"HS256"}`, the header every issued token carries.
const DEFAULT_JWT_HEADER: &str = "eyJ0eXAiOiJKV1QiLCJhbGciOiJIUzI1NiJ9";

const SERVER_KEY_LENGTH: usize = 32;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Claims of a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The team the bearer acts for
    pub team: String,

    /// Expiration time (unix timestamp)
    pub exp: u64,

    /// Issued at (unix timestamp)
    pub iat: u64,
}

/// The team a request acts for, attached by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team(pub String);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a random secret to sign tokens with.
pub fn generate_server_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SERVER_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Issues an API key for `team`, valid for `ttl`.
///
/// The key is an HS256 JWT with its fixed header replaced by [`API_KEY_PREFIX`].
pub fn issue_api_key(server_key: &str, team: &str, ttl: TimeDelta) -> NimbusResult<String> {
    let now = Utc::now();
    let claims = Claims {
        team: team.to_string(),
        exp: (now + ttl).timestamp().max(0) as u64,
        iat: now.timestamp().max(0) as u64,
    };

    let jwt = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(server_key.as_bytes()),
    )
    .map_err(|e| NimbusError::custom(anyhow::anyhow!("failed to sign token: {e}")))?;

    match jwt.split('.').collect::<Vec<_>>().as_slice() {
        [_, payload, signature] => Ok(format!("{API_KEY_PREFIX}{payload}.{signature}")),
        _ => Err(NimbusError::custom(anyhow::anyhow!(
            "signed token is not a JWT"
        ))),
    }
}

/// Validates a bearer token and returns its claims.
///
/// Accepts both prefixed API keys and plain JWTs.
pub fn verify_api_key(server_key: &str, token: &str) -> NimbusResult<Claims> {
    let jwt = match token.strip_prefix(API_KEY_PREFIX) {
        Some(rest) => match rest.split('.').collect::<Vec<_>>().as_slice() {
            [payload, signature] => format!("{DEFAULT_JWT_HEADER}.{payload}.{signature}"),
            _ => return Err(NimbusError::Unauthenticated("invalid token format".into())),
        },
        None => token.to_string(),
    };

    decode::<Claims>(
        &jwt,
        &DecodingKey::from_secret(server_key.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            NimbusError::Unauthenticated("token expired".into())
        }
        jsonwebtoken::errors::ErrorKind::InvalidSignature
        | jsonwebtoken::errors::ErrorKind::InvalidToken => {
            NimbusError::Unauthenticated("invalid token".into())
        }
        _ => NimbusError::Unauthenticated(format!("token validation error: {e}")),
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Middleware
//--------------------------------------------------------------------------------------------------

/// Works out which team a request acts for.
///
/// With a server key the team comes from the bearer token. Without one the server is in local
/// mode and takes the team from the `X-Nimbus-Team` header.
pub async fn auth_middleware(
    State(state): State<ServerState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let team = match state.server_key() {
        Some(key) => {
            let token = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "));

            let Some(token) = token else {
                return ApiError(NimbusError::Unauthenticated(
                    "missing or invalid Bearer token".into(),
                ))
                .into_response();
            };

            match verify_api_key(key, token) {
                Ok(claims) => claims.team,
                Err(e) => {
                    tracing::debug!(error = %e, "rejected bearer token");
                    return ApiError(e).into_response();
                }
            }
        }
        None => req
            .headers()
            .get(TEAM_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TEAM)
            .to_string(),
    };

    req.extensions_mut().insert(Team(team));
    next.run(req).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
