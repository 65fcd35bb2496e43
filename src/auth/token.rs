//! User JWT issuance and validation (HS256)

use crate::auth::context::UserIdentity;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token failures, collapsed to 401 at the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i32,
    exp: i64,
}

/// HS256 key pair derived from the `JWT_SECRET` environment secret.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token for a user id. The identity service is the production
    /// issuer; this lives here for admin tooling and tests.
    pub fn issue(&self, user_id: i32, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id,
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| AuthError::InvalidToken)
    }

    /// Validate a bearer token and extract the user identity.
    pub fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(UserIdentity {
            user_id: data.claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_verify_roundtrip() {
        let keys = TokenKeys::new("test-secret");
        let token = keys.issue(42, Duration::from_secs(60)).unwrap();
        let identity = keys.verify(&token).unwrap();
        assert_eq!(identity.user_id, 42);
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = TokenKeys::new("test-secret");
        let claims = Claims {
            sub: 42,
            exp: Utc::now().timestamp() - 120,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert!(matches!(keys.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let keys = TokenKeys::new("test-secret");
        let other = TokenKeys::new("other-secret");
        let token = other.issue(42, Duration::from_secs(60)).unwrap();
        assert!(keys.verify(&token).is_err());
    }
}
