//! Bearer token issuance and verification.
//!
//! Tokens look like `v1.<user-id>.<expiry>.<mac>` where `expiry` is a unix
//! timestamp in seconds and `mac` is the hex keyed BLAKE3 hash of
//! `<user-id>.<expiry>` under the server secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

use palaver_shared::UserId;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

#[derive(Clone)]
pub struct TokenAuthority {
    secret: [u8; 32],
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(secret: [u8; 32], ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn issue(&self, user: &UserId) -> String {
        self.issue_at(user, unix_now())
    }

    fn issue_at(&self, user: &UserId, now: u64) -> String {
        let expiry = now.saturating_add(self.ttl.as_secs());
        let payload = format!("{user}.{expiry}");
        let mac = blake3::keyed_hash(&self.secret, payload.as_bytes());
        format!("{TOKEN_VERSION}.{payload}.{}", mac.to_hex())
    }

    /// Returns the user a token was issued for. Does not check that the user
    /// still exists.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<UserId, AuthError> {
        let mut parts = token.trim().split('.');
        let (Some(version), Some(user), Some(expiry), Some(mac), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(AuthError::Malformed);
        };
        if version != TOKEN_VERSION {
            return Err(AuthError::Malformed);
        }

        let mut provided = [0u8; 32];
        hex::decode_to_slice(mac, &mut provided).map_err(|_| AuthError::Malformed)?;

        let payload = format!("{user}.{expiry}");
        let expected = blake3::keyed_hash(&self.secret, payload.as_bytes());
        if expected.as_bytes().ct_eq(&provided).unwrap_u8() != 1 {
            return Err(AuthError::BadSignature);
        }

        let expiry: u64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        if now >= expiry {
            return Err(AuthError::Expired);
        }

        UserId::parse(user).map_err(|_| AuthError::Malformed)
    }
}

/// Token from an `Authorization: Bearer ...` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new([7u8; 32], Duration::from_secs(60))
    }

    #[test]
    fn test_issue_then_verify() {
        let auth = authority();
        let user = UserId::new();
        let token = auth.issue(&user);
        assert!(token.starts_with("v1."));
        assert_eq!(auth.verify(&token), Ok(user));
    }

    #[test]
    fn test_expired() {
        let auth = authority();
        let user = UserId::new();
        let token = auth.issue_at(&user, 1_000);
        assert_eq!(auth.verify_at(&token, 1_059), Ok(user));
        assert_eq!(auth.verify_at(&token, 1_060), Err(AuthError::Expired));
    }

    #[test]
    fn test_other_secret_rejected() {
        let token = authority().issue(&UserId::new());
        let other = TokenAuthority::new([8u8; 32], Duration::from_secs(60));
        assert_eq!(other.verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_tampered_user_rejected() {
        let auth = authority();
        let token = auth.issue(&UserId::new());
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("v1.{}.{}.{}", UserId::new(), parts[2], parts[3]);
        assert_eq!(auth.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let auth = authority();
        assert_eq!(auth.verify(""), Err(AuthError::Malformed));
        assert_eq!(auth.verify("v1.a.b"), Err(AuthError::Malformed));
        assert_eq!(auth.verify("v1.a.b.zz"), Err(AuthError::Malformed));
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
