//! Bearer token verification for request classification.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identity carried by a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: String,

    /// Subscription tier, when the token carries one
    pub tier: Option<String>,
}

/// Token checks used by the middleware. Verification never fails loudly:
/// any problem means "no identity".
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Claims>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserIdClaim {
    Text(String),
    Number(i64),
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    user_id: Option<UserIdClaim>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    tier: Option<String>,
}

#[derive(Serialize)]
struct IssuedClaims<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<&'a str>,
    exp: usize,
    iat: usize,
}

/// HS256 verifier
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Arc<String>,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
        }
    }

    /// Read `JWT_SECRET`
    pub fn from_env() -> Option<Self> {
        std::env::var("JWT_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .map(Self::new)
    }

    /// Sign a token for `user_id`, valid for `ttl`
    pub fn issue(
        &self,
        user_id: &str,
        tier: Option<&str>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp().max(0) as usize;
        let claims = IssuedClaims {
            user_id,
            tier,
            exp: now + ttl.as_secs() as usize,
            iat: now,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<Claims> {
        let decoding_key = DecodingKey::from_secret(self.secret.as_bytes());
        let validation = Validation::new(Algorithm::HS256);

        let raw = decode::<RawClaims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| debug!("Token validation failed: {}", e))
            .ok()?;

        let user_id = match raw.user_id {
            Some(UserIdClaim::Text(id)) => id,
            Some(UserIdClaim::Number(id)) => id.to_string(),
            None => raw.sub?,
        };

        if user_id.is_empty() {
            return None;
        }

        Some(Claims {
            user_id,
            tier: raw.tier,
        })
    }
}

/// Verifier that accepts nothing, for deployments without a JWT secret
pub struct NoAuth;

impl TokenVerifier for NoAuth {
    fn verify(&self, _token: &str) -> Option<Claims> {
        None
    }
}

/// Token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-characters-long";

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3_600
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = JwtVerifier::new(SECRET);
        let token = verifier
            .issue("42", Some("pro"), Duration::from_secs(60))
            .unwrap();

        assert_eq!(
            verifier.verify(&token),
            Some(Claims {
                user_id: "42".into(),
                tier: Some("pro".into()),
            })
        );
    }

    #[test]
    fn test_numeric_user_id_and_sub_fallback() {
        let verifier = JwtVerifier::new(SECRET);

        let numeric = sign(serde_json::json!({ "user_id": 7, "exp": future_exp() }));
        assert_eq!(verifier.verify(&numeric).unwrap().user_id, "7");

        let sub = sign(serde_json::json!({ "sub": "abc", "exp": future_exp() }));
        assert_eq!(verifier.verify(&sub).unwrap().user_id, "abc");

        let neither = sign(serde_json::json!({ "exp": future_exp() }));
        assert_eq!(verifier.verify(&neither), None);
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let verifier = JwtVerifier::new(SECRET);

        assert_eq!(verifier.verify("not-a-jwt"), None);

        let other = JwtVerifier::new("another-secret-of-sufficient-length!!")
            .issue("42", None, Duration::from_secs(60))
            .unwrap();
        assert_eq!(verifier.verify(&other), None);

        let expired = sign(serde_json::json!({
            "user_id": "42",
            "exp": Utc::now().timestamp() - 3_600,
        }));
        assert_eq!(verifier.verify(&expired), None);
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer   xyz "), Some("xyz"));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
