//! Bearer token validation.
//!
//! Tokens are HS256 JWTs issued by an external identity service. This module
//! only verifies them; issuance and refresh live elsewhere.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use fieldsync_core::TenantId;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user or device identity).
    pub sub: String,

    /// Tenant the token is scoped to.
    pub tenant_id: TenantId,

    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,

    #[error("malformed or unverifiable token: {0}")]
    Invalid(String),
}

/// Check the claim time window against `now`.
pub fn validate_claims(claims: &AccessClaims, now: DateTime<Utc>) -> Result<(), TokenError> {
    if claims.exp <= claims.iat {
        return Err(TokenError::InvalidTimeWindow);
    }
    let now = now.timestamp();
    if now < claims.iat {
        return Err(TokenError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenError::Expired);
    }
    Ok(())
}

/// Verifies a raw bearer token and yields its claims.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError>;
}

/// HS256 shared-secret validator.
pub struct Hs256TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256TokenValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time window is checked by `validate_claims` against the caller's clock.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenValidator for Hs256TokenValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn encode(secret: &str, claims: &AccessClaims) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(now: DateTime<Utc>, ttl_secs: i64) -> AccessClaims {
        AccessClaims {
            sub: "device-1".to_string(),
            tenant_id: TenantId::new(),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl_secs,
        }
    }

    #[test]
    fn valid_token_yields_claims() {
        let now = Utc::now();
        let expected = claims(now, 600);
        let token = encode("secret", &expected);

        let got = Hs256TokenValidator::new(b"secret").validate(&token, now).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now();
        let token = encode("secret", &claims(now, 600));

        let err = Hs256TokenValidator::new(b"other").validate(&token, now).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now();
        let token = encode("secret", &claims(now, 60));

        let later = now + chrono::Duration::seconds(61);
        let err = Hs256TokenValidator::new(b"secret").validate(&token, later).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn claims_time_window_is_checked() {
        let now = Utc::now();
        let mut c = claims(now, 60);
        c.exp = c.iat;
        assert_eq!(validate_claims(&c, now), Err(TokenError::InvalidTimeWindow));

        let c = claims(now + chrono::Duration::seconds(30), 60);
        assert_eq!(validate_claims(&c, now), Err(TokenError::NotYetValid));
    }
}
