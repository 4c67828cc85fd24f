//! Queue-pass JWT signing and validation (HS256).
//!
//! Scope is deliberately narrow: this signs only the short-lived pass that
//! proves a user was admitted off the virtual queue for one event. General
//! user-identity authentication is out of scope.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use thiserror::Error;

use crate::types::{EventId, QueuePassClaims, UserId};

/// Errors surfaced while signing or validating a queue-pass JWT.
#[derive(Debug, Error)]
pub enum QueuePassJwtError {
    /// The token failed signature verification or was malformed.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    /// The token was syntactically valid but has expired.
    #[error("queue pass has expired")]
    Expired,
    /// The token's `purpose` claim was not `queue_pass`.
    #[error("token is not a queue pass")]
    WrongPurpose,
}

/// Issues and validates queue-pass JWTs for a single HMAC secret.
#[derive(Clone)]
pub struct QueuePassSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl_seconds: i64,
}

impl QueuePassSigner {
    /// Build a signer from a shared secret.
    #[must_use]
    pub fn new(secret: &str, issuer: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            ttl_seconds,
        }
    }

    /// Sign a new queue pass admitting `user_id` to `event_id`.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be encoded.
    pub fn sign(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<String, QueuePassJwtError> {
        let now = Utc::now().timestamp();
        let mut jti_bytes = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut jti_bytes);
        let jti = hex::encode(jti_bytes);

        let claims = QueuePassClaims {
            sub: user_id.to_string(),
            user_id,
            event_id,
            purpose: "queue_pass".to_string(),
            iss: self.issuer.clone(),
            jti,
            iat: now,
            nbf: now,
            exp: now + self.ttl_seconds,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// Validate and decode a queue-pass JWT.
    ///
    /// # Errors
    /// Returns [`QueuePassJwtError::Expired`] if the token expired,
    /// [`QueuePassJwtError::WrongPurpose`] if it is not a queue pass, or
    /// [`QueuePassJwtError::Invalid`] on any signature/format failure.
    pub fn validate(&self, token: &str) -> Result<QueuePassClaims, QueuePassJwtError> {
        let result = decode::<QueuePassClaims>(token, &self.decoding_key, &Validation::default());

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                return Err(match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        QueuePassJwtError::Expired
                    }
                    _ => QueuePassJwtError::Invalid(err),
                });
            }
        };

        if data.claims.purpose != "queue_pass" {
            return Err(QueuePassJwtError::WrongPurpose);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_validate_round_trips_claims() {
        let signer = QueuePassSigner::new("test-secret", "booking-service", 120);
        let user_id = UserId::new();
        let event_id = EventId::new();

        let token = signer.sign(user_id, event_id).expect("sign");
        let claims = signer.validate(&token).expect("validate");

        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.event_id, event_id);
        assert_eq!(claims.purpose, "queue_pass");
    }

    #[test]
    fn validate_rejects_tokens_signed_with_a_different_secret() {
        let signer_a = QueuePassSigner::new("secret-a", "booking-service", 120);
        let signer_b = QueuePassSigner::new("secret-b", "booking-service", 120);

        let token = signer_a.sign(UserId::new(), EventId::new()).expect("sign");
        let err = signer_b.validate(&token).unwrap_err();
        assert!(matches!(err, QueuePassJwtError::Invalid(_)));
    }

    #[test]
    fn validate_rejects_expired_tokens() {
        let signer = QueuePassSigner::new("test-secret", "booking-service", -1);
        let token = signer.sign(UserId::new(), EventId::new()).expect("sign");
        let err = signer.validate(&token).unwrap_err();
        assert!(matches!(err, QueuePassJwtError::Expired));
    }
}
