//! Signed, time-bounded research link tokens.
//!
//! A token binds a requester and a query to the moment it was issued:
//!
//! ```text
//! v1.<payload>.<signature>
//! payload   = base64url(json {"uid": requester, "q": query, "iat": unix_seconds})
//! signature = base64url(HMAC-SHA256(secret, "v1." + payload))
//! ```
//!
//! Tokens are not encrypted. The fields are readable by anyone holding the link, but cannot be
//! altered without invalidating the signature. Base64 decoding is canonical, so every bit of the
//! token is covered.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const VERSION_PREFIX: &str = "v1.";

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Why a token failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("token signature does not match")]
    BadSignature,

    #[error("token has expired")]
    Expired,
}

/// Fields recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkClaims {
    pub requester: String,
    pub query: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Payload {
    uid: String,
    q: String,
    iat: i64,
}

/// Issues and verifies research link tokens with a deployment-wide secret and TTL.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.secret).unwrap_or_else(|_| unreachable!("HMAC accepts any key length"))
    }

    /// Issue a token for `(requester, query)` stamped with the current time.
    pub fn issue(&self, requester: &str, query: &str) -> String {
        self.issue_at(requester, query, Utc::now())
    }

    /// Issue a token stamped with `issued_at`.
    pub fn issue_at(&self, requester: &str, query: &str, issued_at: DateTime<Utc>) -> String {
        let payload = serde_json::json!({
            "uid": requester,
            "q": query,
            "iat": issued_at.timestamp(),
        });
        let encoded = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signed = format!("{VERSION_PREFIX}{encoded}");

        let mut mac = self.mac();
        mac.update(signed.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("{signed}.{signature}")
    }

    /// Verify a token against the current time.
    pub fn verify(&self, token: &str) -> Result<LinkClaims, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token as of `now`.
    ///
    /// The signature is checked in constant time before the payload is decoded.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<LinkClaims, TokenError> {
        let rest = token.strip_prefix(VERSION_PREFIX).ok_or(TokenError::Malformed)?;
        let (encoded, signature) = rest.split_once('.').ok_or(TokenError::Malformed)?;
        if encoded.is_empty() || signature.contains('.') {
            return Err(TokenError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(VERSION_PREFIX.as_bytes());
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| TokenError::Malformed)?;
        let payload: Payload = serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;
        let issued_at = DateTime::from_timestamp(payload.iat, 0).ok_or(TokenError::Malformed)?;

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(issued_at) > ttl {
            return Err(TokenError::Expired);
        }

        Ok(LinkClaims {
            requester: payload.uid,
            query: payload.q,
            issued_at,
        })
    }

    /// Build the one-click link for `(requester, query)` under `base_url`.
    pub fn link(&self, base_url: &Url, requester: &str, query: &str) -> anyhow::Result<Url> {
        let token = self.issue(requester, query);
        let mut url = base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("base URL {base_url} cannot carry a path"))?
            .pop_if_empty()
            .push("research");
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("uid", requester)
            .append_pair("tk", &token);
        Ok(url)
    }
}

/// Generate a random link secret suitable for `links.secret`.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    URL_SAFE_NO_PAD.encode(secret_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "an-hmac-secret-that-is-long-enough-for-tests";
    const DAY: Duration = Duration::from_secs(86_400);

    fn codec() -> TokenCodec {
        TokenCodec::new(SECRET, DAY)
    }

    #[test]
    fn test_roundtrip_before_expiry() {
        let codec = codec();
        let issued = Utc::now();
        let token = codec.issue_at("u1", "supply-chain forecasting", issued);

        let claims = codec.verify_at(&token, issued + chrono::Duration::hours(1)).unwrap();
        assert_eq!(claims.requester, "u1");
        assert_eq!(claims.query, "supply-chain forecasting");
        assert_eq!(claims.issued_at.timestamp(), issued.timestamp());
    }

    #[test]
    fn test_roundtrip_preserves_unicode_and_separators() {
        let codec = codec();
        let token = codec.issue("ana.lyst@example.com", "qué es \"v1.x\" & más?");
        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.requester, "ana.lyst@example.com");
        assert_eq!(claims.query, "qué es \"v1.x\" & más?");
    }

    #[test]
    fn test_ttl_boundary() {
        let codec = codec();
        let issued = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let token = codec.issue_at("u1", "topic", issued);
        let ttl = chrono::Duration::seconds(86_400);

        assert!(codec.verify_at(&token, issued + ttl - chrono::Duration::seconds(1)).is_ok());
        assert!(codec.verify_at(&token, issued + ttl).is_ok());
        assert_eq!(
            codec.verify_at(&token, issued + ttl + chrono::Duration::seconds(1)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let codec = codec();
        let issued = Utc::now();
        let token = codec.issue_at("u1", "supply-chain forecasting", issued);
        let bytes = token.as_bytes();

        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut mutated = bytes.to_vec();
                mutated[i] ^= 1 << bit;
                let mutated = String::from_utf8_lossy(&mutated);

                let result = codec.verify_at(&mutated, issued);
                assert!(
                    matches!(result, Err(TokenError::BadSignature) | Err(TokenError::Malformed)),
                    "flipping bit {bit} of byte {i} gave {result:?}"
                );
            }
        }
    }

    #[test]
    fn test_wrong_secret_is_bad_signature() {
        let token = codec().issue("u1", "topic");
        let other = TokenCodec::new("a-completely-different-secret-of-enough-length", DAY);
        assert_eq!(other.verify(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_structural_garbage_is_malformed() {
        let codec = codec();
        for token in ["", "v1.", "v1..", "v2.abc.def", "abc", "v1.abc", "v1.abc.d.ef", "v1.abc.!!!"] {
            assert_eq!(codec.verify(token), Err(TokenError::Malformed), "token {token:?}");
        }
    }

    #[test]
    fn test_signed_but_invalid_payload_is_malformed() {
        let codec = codec();
        let encoded = URL_SAFE_NO_PAD.encode(br#"{"uid":"u1"}"#);
        let signed = format!("v1.{encoded}");
        let mut mac = codec.mac();
        mac.update(signed.as_bytes());
        let token = format!("{signed}.{}", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()));

        assert_eq!(codec.verify(&token), Err(TokenError::Malformed));
    }

    #[test]
    fn test_link_carries_verifiable_token() {
        let codec = codec();
        let base = Url::parse("https://research.example.com/app/").unwrap();
        let link = codec.link(&base, "u1@example.com", "battery chemistry & cost").unwrap();

        assert_eq!(link.path(), "/app/research");
        let pairs: std::collections::HashMap<_, _> = link.query_pairs().into_owned().collect();
        assert_eq!(pairs["q"], "battery chemistry & cost");
        assert_eq!(pairs["uid"], "u1@example.com");

        let claims = codec.verify(&pairs["tk"]).unwrap();
        assert_eq!(claims.requester, "u1@example.com");
        assert_eq!(claims.query, "battery chemistry & cost");
    }

    #[test]
    fn test_generated_secrets_are_long_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.len() >= MIN_SECRET_LEN);
        assert_ne!(a, b);
    }
}
