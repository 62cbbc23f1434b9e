//! HS256 bearer tokens.
//!
//! Tokens are issued by the account service with `{ id, tokenVersion, exp }`
//! claims. Only verification is needed in production; [`TokenVerifier::issue`]
//! exists for local tooling and tests.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use locus_core::UserId;
use serde::{Deserialize, Serialize};

use crate::errors::AuthRejection;

/// Claims carried by a session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Profile ID of the user.
    pub id: UserId,
    /// Revocation counter at issue time.
    pub token_version: u64,
    /// Expiry (seconds since the Unix epoch).
    pub exp: u64,
    /// Issue time (seconds since the Unix epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// Verifies (and for tooling, issues) tokens signed with a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Create a verifier for HS256 tokens signed with `secret`.
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Check signature and expiry and return the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthRejection> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthRejection::Missing);
        }
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature
                | ErrorKind::InvalidSignature
                | ErrorKind::ImmatureSignature
                | ErrorKind::InvalidAlgorithm => AuthRejection::Invalid(err.to_string()),
                _ => AuthRejection::Malformed(err.to_string()),
            })
    }

    /// Sign a token for `user_id` valid for `ttl`.
    pub fn issue(
        &self,
        user_id: &UserId,
        token_version: u64,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = u64::try_from(locus_core::time::now_millis() / 1000).unwrap_or(0);
        self.sign(&Claims {
            id: user_id.clone(),
            token_version,
            exp: now + ttl.as_secs(),
            iat: Some(now),
        })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DAY: Duration = Duration::from_secs(86_400);

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-secret")
    }

    #[test]
    fn issued_token_verifies() {
        let v = verifier();
        let token = v.issue(&UserId::from("u1"), 3, DAY).unwrap();
        let claims = v.verify(&token).unwrap();
        assert_eq!(claims.id, UserId::from("u1"));
        assert_eq!(claims.token_version, 3);
        assert!(claims.iat.is_some());
    }

    #[test]
    fn claims_use_camel_case() {
        let claims = Claims {
            id: UserId::from("u1"),
            token_version: 7,
            exp: 1,
            iat: None,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["tokenVersion"], 7);
        assert!(json.get("iat").is_none());
    }

    #[test]
    fn empty_token_is_missing() {
        assert_matches!(verifier().verify("  "), Err(AuthRejection::Missing));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_matches!(verifier().verify("not-a-jwt"), Err(AuthRejection::Malformed(_)));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = TokenVerifier::new("other-secret")
            .issue(&UserId::from("u1"), 1, DAY)
            .unwrap();
        assert_matches!(verifier().verify(&token), Err(AuthRejection::Invalid(_)));
    }

    #[test]
    fn expired_token_is_invalid() {
        let v = verifier();
        let token = v
            .sign(&Claims {
                id: UserId::from("u1"),
                token_version: 1,
                exp: 1_000_000,
                iat: None,
            })
            .unwrap();
        assert_matches!(v.verify(&token), Err(AuthRejection::Invalid(_)));
    }

    #[test]
    fn debug_hides_secret() {
        let debug = format!("{:?}", verifier());
        assert!(!debug.contains("test-secret"));
    }
}
