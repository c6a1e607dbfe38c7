use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

use crate::error::RealtimeError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    iat: i64,
    exp: i64,
}

/// Who a bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// HS256 bearer tokens whose subject is `user:<id>`.
#[derive(Clone)]
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<Identity, RealtimeError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(RealtimeError::Authentication("missing token".into()));
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| RealtimeError::Authentication(e.to_string()))?;
        let user_id = data
            .claims
            .sub
            .strip_prefix("user:")
            .and_then(|id| id.parse::<i64>().ok())
            .map(UserId)
            .ok_or_else(|| RealtimeError::Authentication("malformed subject".into()))?;
        Ok(Identity {
            user_id,
            username: data.claims.username,
        })
    }

    pub fn mint(
        &self,
        user_id: UserId,
        username: &str,
        ttl_seconds: i64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: format!("user:{}", user_id.0),
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
