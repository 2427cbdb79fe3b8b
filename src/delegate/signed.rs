//! Signed URL authorization.
//!
//! URLs are signed by computing an HMAC-SHA256 over the path and query
//! parameters (excluding `sig`), binding the signature to the full request:
//!
//! ```text
//! signature = HMAC-SHA256(secret_key, "{path}?{canonical_query}")
//! ```
//!
//! The query must carry `exp` (Unix seconds) and may carry extra parameters.
//! Parameters are sorted for the canonical form.
//!
//! ```text
//! /iiif/3/cat.jpg/full/max/0/default.jpg?exp=1735689600&sig=abc123...
//! ```
//!
//! Verification compares signatures in constant time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use url::form_urlencoded;

use super::{AuthOutcome, Delegate, DelegateContext};
use crate::error::ConfigError;

/// HMAC-SHA256 type alias
type HmacSha256 = Hmac<Sha256>;

/// `WWW-Authenticate` challenge sent with 401 responses.
pub const SIGNATURE_CHALLENGE: &str = "Signature realm=\"iiif\"";

/// Reasons a signed URL fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Missing signature parameter")]
    MissingSignature,

    #[error("Missing expiry parameter")]
    MissingExpiry,

    #[error("Signature expired at {expired_at} (current time: {current_time})")]
    Expired { expired_at: u64, current_time: u64 },

    #[error("Invalid signature")]
    InvalidSignature,

    /// Not valid hex, or repeated
    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    /// Not an integer, or repeated
    #[error("Invalid expiry format")]
    InvalidExpiryFormat,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// =============================================================================
// UrlSigner
// =============================================================================

/// Generates and verifies HMAC-SHA256 URL signatures.
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an empty key.
    pub fn new(secret_key: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let key = secret_key.as_ref();
        if key.is_empty() {
            return Err(ConfigError::Invalid(
                "signing secret must not be empty".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| ConfigError::Invalid(format!("signing secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Sign a path valid for `ttl`. Returns (signature, expiry).
    pub fn sign(&self, path: &str, ttl: Duration) -> (String, u64) {
        self.sign_with_params(path, ttl, &[])
    }

    /// Sign a path with extra query parameters.
    ///
    /// `params` should exclude `exp` and `sig`; those are added automatically.
    pub fn sign_with_params(
        &self,
        path: &str,
        ttl: Duration,
        params: &[(&str, &str)],
    ) -> (String, u64) {
        let expiry = now_secs() + ttl.as_secs();
        (self.sign_with_expiry(path, expiry, params), expiry)
    }

    /// Sign a path with a specific expiry timestamp.
    pub fn sign_with_expiry(&self, path: &str, expiry: u64, params: &[(&str, &str)]) -> String {
        let message = signature_base(path, expiry, params);
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a signature for a path, expiry and extra parameters.
    pub fn verify(
        &self,
        path: &str,
        signature: &str,
        expiry: u64,
        params: &[(&str, &str)],
    ) -> Result<(), SignatureError> {
        let current_time = now_secs();
        if current_time > expiry {
            return Err(SignatureError::Expired {
                expired_at: expiry,
                current_time,
            });
        }

        let provided = hex::decode(signature).map_err(|_| SignatureError::InvalidSignatureFormat)?;
        let expected = hex::decode(self.sign_with_expiry(path, expiry, params))
            .map_err(|_| SignatureError::InvalidSignatureFormat)?;

        if provided.ct_eq(&expected).into() {
            Ok(())
        } else {
            Err(SignatureError::InvalidSignature)
        }
    }

    /// Verify a request given its path and decoded query parameters.
    pub fn verify_query(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<(), SignatureError> {
        let mut signature: Option<&str> = None;
        let mut expiry: Option<u64> = None;
        let mut extra: Vec<(&str, &str)> = Vec::new();

        for (key, value) in query {
            match key.as_str() {
                "sig" => {
                    if signature.is_some() {
                        return Err(SignatureError::InvalidSignatureFormat);
                    }
                    signature = Some(value.as_str());
                }
                "exp" => {
                    if expiry.is_some() {
                        return Err(SignatureError::InvalidExpiryFormat);
                    }
                    let parsed = value
                        .parse::<u64>()
                        .map_err(|_| SignatureError::InvalidExpiryFormat)?;
                    expiry = Some(parsed);
                }
                _ => extra.push((key.as_str(), value.as_str())),
            }
        }

        let signature = signature.ok_or(SignatureError::MissingSignature)?;
        let expiry = expiry.ok_or(SignatureError::MissingExpiry)?;
        self.verify(path, signature, expiry, &extra)
    }

    /// Verify a request and classify the result as clients see it: a
    /// missing or expired signature is challenged, anything else invalid is
    /// denied.
    pub fn authorize(&self, path: &str, query: &[(String, String)]) -> AuthOutcome {
        match self.verify_query(path, query) {
            Ok(()) => AuthOutcome::Allow,
            Err(
                e @ (SignatureError::MissingSignature
                | SignatureError::MissingExpiry
                | SignatureError::Expired { .. }),
            ) => {
                debug!(path = %path, reason = %e, "Signature challenge");
                AuthOutcome::Challenge(SIGNATURE_CHALLENGE.to_string())
            }
            Err(e) => {
                warn!(path = %path, reason = %e, "Signature rejected");
                AuthOutcome::Deny
            }
        }
    }

    /// Generate a complete signed URL.
    pub fn generate_signed_url(
        &self,
        base_url: &str,
        path: &str,
        ttl: Duration,
        extra_params: &[(&str, &str)],
    ) -> String {
        let (signature, expiry) = self.sign_with_params(path, ttl, extra_params);

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in extra_params {
            serializer.append_pair(key, value);
        }
        serializer.append_pair("exp", &expiry.to_string());
        serializer.append_pair("sig", &signature);

        format!("{}{}?{}", base_url, path, serializer.finish())
    }
}

fn signature_base(path: &str, expiry: u64, params: &[(&str, &str)]) -> String {
    let mut all_params: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect();
    all_params.push(("exp".to_string(), expiry.to_string()));
    format!("{}?{}", path, canonical_query(&all_params))
}

fn canonical_query(params: &[(String, String)]) -> String {
    let mut pairs = params.to_vec();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

// =============================================================================
// SignedUrlDelegate
// =============================================================================

/// Delegate that requires a valid signed URL before any source access.
///
/// Missing or expired signatures yield a challenge (401); a wrong or
/// malformed signature is denied outright (403).
#[derive(Clone)]
pub struct SignedUrlDelegate {
    signer: UrlSigner,
}

impl SignedUrlDelegate {
    pub fn new(signer: UrlSigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Delegate for SignedUrlDelegate {
    async fn authorize_before_access(&self, ctx: &DelegateContext) -> AuthOutcome {
        if ctx.client.trusted {
            return AuthOutcome::Allow;
        }
        self.signer.authorize(&ctx.client.path, &ctx.client.query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::ClientContext;
    use crate::operation::Identifier;

    const PATH: &str = "/iiif/3/cat.jpg/full/max/0/default.jpg";

    fn signer() -> UrlSigner {
        UrlSigner::new("test-secret-key").unwrap()
    }

    fn ctx(query: Vec<(String, String)>) -> DelegateContext {
        DelegateContext::new(Identifier::new("cat.jpg"), ClientContext::new(PATH, query))
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = signer();
        let (sig, exp) = signer.sign(PATH, Duration::from_secs(3600));
        assert!(signer.verify(PATH, &sig, exp, &[]).is_ok());
    }

    #[test]
    fn test_verify_wrong_path() {
        let signer = signer();
        let (sig, exp) = signer.sign(PATH, Duration::from_secs(3600));
        assert_eq!(
            signer.verify("/iiif/3/dog.jpg/full/max/0/default.jpg", &sig, exp, &[]),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_expired() {
        let signer = signer();
        let sig = signer.sign_with_expiry(PATH, 1, &[]);
        assert!(matches!(
            signer.verify(PATH, &sig, 1, &[]),
            Err(SignatureError::Expired { expired_at: 1, .. })
        ));
    }

    #[test]
    fn test_params_are_bound_in_any_order() {
        let signer = signer();
        let (sig, exp) =
            signer.sign_with_params(PATH, Duration::from_secs(60), &[("b", "2"), ("a", "1")]);
        assert!(signer.verify(PATH, &sig, exp, &[("a", "1"), ("b", "2")]).is_ok());
        assert!(signer.verify(PATH, &sig, exp, &[("a", "1")]).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(UrlSigner::new("").is_err());
    }

    #[test]
    fn test_verify_query_rejects_duplicates() {
        let signer = signer();
        let query = vec![
            ("sig".to_string(), "aa".to_string()),
            ("sig".to_string(), "bb".to_string()),
        ];
        assert_eq!(
            signer.verify_query(PATH, &query),
            Err(SignatureError::InvalidSignatureFormat)
        );
    }

    #[test]
    fn test_generate_signed_url() {
        let signer = signer();
        let url = signer.generate_signed_url("https://example.com", PATH, Duration::from_secs(60), &[]);
        assert!(url.starts_with("https://example.com/iiif/3/cat.jpg/"));
        assert!(url.contains("exp="));
        assert!(url.contains("&sig="));
    }

    #[tokio::test]
    async fn test_delegate_outcomes() {
        let signer = signer();
        let delegate = SignedUrlDelegate::new(signer.clone());

        let (sig, exp) = signer.sign(PATH, Duration::from_secs(60));
        let valid = ctx(vec![("exp".into(), exp.to_string()), ("sig".into(), sig)]);
        assert_eq!(delegate.authorize_before_access(&valid).await, AuthOutcome::Allow);

        let missing = ctx(Vec::new());
        assert_eq!(
            delegate.authorize_before_access(&missing).await,
            AuthOutcome::Challenge(SIGNATURE_CHALLENGE.to_string())
        );

        let expired_sig = signer.sign_with_expiry(PATH, 1, &[]);
        let expired = ctx(vec![("exp".into(), "1".into()), ("sig".into(), expired_sig)]);
        assert!(matches!(
            delegate.authorize_before_access(&expired).await,
            AuthOutcome::Challenge(_)
        ));

        let forged = ctx(vec![
            ("exp".into(), exp.to_string()),
            ("sig".into(), "00".repeat(32)),
        ]);
        assert_eq!(delegate.authorize_before_access(&forged).await, AuthOutcome::Deny);

        let mut internal = ctx(Vec::new());
        internal.client = ClientContext::internal();
        assert_eq!(delegate.authorize_before_access(&internal).await, AuthOutcome::Allow);
    }
}
