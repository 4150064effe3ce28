//! Bearer-token validation for the WebSocket handshake.
//!
//! Token issuance lives elsewhere; this side only verifies HS256
//! signatures and expiry, and surfaces the identity claims the
//! namespace stores in its session.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

/// Claims carried by platform-issued access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, stringified.
    pub sub: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Identity extracted from a validated token.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: i64,
    pub user_name: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthedUser {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Validate a bearer token and return the identity it asserts.
pub fn validate_token(token: &str, secret: &str) -> Result<AuthedUser, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::InvalidToken(e.to_string()),
    })?;

    let user_id = data
        .claims
        .sub
        .parse::<i64>()
        .map_err(|_| AuthError::InvalidToken("sub is not a user id".into()))?;

    let expires_at = Utc
        .timestamp_opt(data.claims.exp, 0)
        .single()
        .ok_or_else(|| AuthError::InvalidToken("exp out of range".into()))?;

    Ok(AuthedUser {
        user_id,
        user_name: data.claims.name,
        expires_at,
    })
}

/// Mint a short-lived token for downstream callbacks (executor → control
/// plane). Same claim shape as user tokens so the callback path validates
/// uniformly.
pub fn issue_service_token(
    user_id: i64,
    name: &str,
    ttl: chrono::Duration,
    secret: &str,
) -> Result<String, AuthError> {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims {
        sub: user_id.to_string(),
        name: name.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
pub(crate) fn issue_token(user_id: i64, name: &str, exp: DateTime<Utc>, secret: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims {
        sub: user_id.to_string(),
        name: name.to_string(),
        exp: exp.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "test-secret";

    #[test]
    fn valid_token_roundtrips_identity() {
        let exp = Utc::now() + Duration::hours(1);
        let token = issue_token(42, "ada", exp, SECRET);

        let user = validate_token(&token, SECRET).unwrap();
        assert_eq!(user.user_id, 42);
        assert_eq!(user.user_name, "ada");
        assert!(!user.is_expired(Utc::now()));
    }

    #[test]
    fn expired_token_is_rejected() {
        let exp = Utc::now() - Duration::hours(1);
        let token = issue_token(42, "ada", exp, SECRET);
        assert!(matches!(
            validate_token(&token, SECRET),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let exp = Utc::now() + Duration::hours(1);
        let token = issue_token(42, "ada", exp, SECRET);
        assert!(matches!(
            validate_token(&token, "other-secret"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn empty_token_is_missing() {
        assert!(matches!(
            validate_token("  ", SECRET),
            Err(AuthError::MissingToken)
        ));
    }
}
