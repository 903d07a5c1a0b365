//! Signed, expiring live-tail URLs.
//!
//! A URL carries the execution id, the subject and an expiry, plus an
//! HMAC-SHA256 signature over those fields and the client address the URL was
//! issued to. The stream server calls [`SignedUrlIssuer::verify`] with the
//! address of the connecting client; a URL replayed from another address, past
//! its expiry, or with any field altered is rejected.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::{ProviderError, WebSocketManager};

type HmacSha256 = Hmac<Sha256>;

const PARAM_EXECUTION: &str = "execution_id";
const PARAM_SUBJECT: &str = "subject";
const PARAM_EXPIRES: &str = "expires";
const PARAM_SIGNATURE: &str = "signature";

/// Fields recovered from a verified stream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamClaims {
    /// Execution whose logs may be streamed.
    pub execution_id: String,
    /// Subject the URL was issued to.
    pub subject: String,
    /// Expiry of the URL.
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies stream URLs with a shared signing key.
#[derive(Clone)]
pub struct SignedUrlIssuer {
    base_url: Url,
    key: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for SignedUrlIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedUrlIssuer")
            .field("base_url", &self.base_url.as_str())
            .field("key", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SignedUrlIssuer {
    /// Build an issuer for `base_url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::StreamUrl`] for an unparsable or non-websocket
    /// base URL, an empty key, or a non-positive TTL.
    pub fn new(base_url: &str, key: impl Into<Vec<u8>>, ttl: Duration) -> Result<Self, ProviderError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ProviderError::StreamUrl(format!("base url: {e}")))?;
        if !matches!(base_url.scheme(), "ws" | "wss") {
            return Err(ProviderError::StreamUrl(format!(
                "base url must use ws or wss, got {}",
                base_url.scheme()
            )));
        }
        let key = key.into();
        if key.is_empty() {
            return Err(ProviderError::StreamUrl("signing key is empty".to_owned()));
        }
        if ttl <= Duration::zero() {
            return Err(ProviderError::StreamUrl("ttl must be positive".to_owned()));
        }
        Ok(Self { base_url, key, ttl })
    }

    /// Mint a URL as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::StreamUrl`] if the expiry overflows or signing fails.
    pub fn issue_at(
        &self,
        execution_id: &str,
        subject: &str,
        client_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let expires = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| ProviderError::StreamUrl("expiry out of range".to_owned()))?
            .timestamp();
        let signature = hex::encode(self.sign(execution_id, subject, client_addr, expires)?);

        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(PARAM_EXECUTION, execution_id)
            .append_pair(PARAM_SUBJECT, subject)
            .append_pair(PARAM_EXPIRES, &expires.to_string())
            .append_pair(PARAM_SIGNATURE, &signature);
        Ok(url.into())
    }

    /// Check a URL presented by the client at `client_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::StreamUrl`] when a field is missing, the URL has
    /// expired, or the signature does not match.
    pub fn verify(
        &self,
        raw_url: &str,
        client_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<StreamClaims, ProviderError> {
        let url = Url::parse(raw_url).map_err(|e| ProviderError::StreamUrl(e.to_string()))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let field = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::StreamUrl(format!("missing {name}")))
        };

        let execution_id = field(PARAM_EXECUTION)?;
        let subject = field(PARAM_SUBJECT)?;
        let expires: i64 = field(PARAM_EXPIRES)?
            .parse()
            .map_err(|_| ProviderError::StreamUrl("malformed expires".to_owned()))?;
        let signature = hex::decode(field(PARAM_SIGNATURE)?)
            .map_err(|_| ProviderError::StreamUrl("malformed signature".to_owned()))?;

        let mut mac = self.mac()?;
        mac.update(signing_input(&execution_id, &subject, client_addr, expires).as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ProviderError::StreamUrl("signature mismatch".to_owned()))?;

        if now.timestamp() > expires {
            return Err(ProviderError::StreamUrl("url expired".to_owned()));
        }
        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| ProviderError::StreamUrl("expires out of range".to_owned()))?;

        Ok(StreamClaims {
            execution_id,
            subject,
            expires_at,
        })
    }

    fn mac(&self) -> Result<HmacSha256, ProviderError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| ProviderError::StreamUrl(e.to_string()))
    }

    fn sign(
        &self,
        execution_id: &str,
        subject: &str,
        client_addr: &str,
        expires: i64,
    ) -> Result<Vec<u8>, ProviderError> {
        let mut mac = self.mac()?;
        mac.update(signing_input(execution_id, subject, client_addr, expires).as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn signing_input(execution_id: &str, subject: &str, client_addr: &str, expires: i64) -> String {
    format!("{execution_id}\n{subject}\n{client_addr}\n{expires}")
}

#[async_trait]
impl WebSocketManager for SignedUrlIssuer {
    async fn generate_url(
        &self,
        execution_id: &str,
        subject: &str,
        client_addr: &str,
    ) -> Result<String, ProviderError> {
        let url = self.issue_at(execution_id, subject, client_addr, Utc::now())?;
        debug!(execution_id, subject, "stream url issued");
        Ok(url)
    }
}
