//! Short-lived per-installation access tokens.
//!
//! Tokens are minted through the application's private key and cached per
//! installation. The cache max-age is `validity - usage_window`, so a token
//! is always refreshed with margin before the remote platform would reject
//! it: a handed-out token has at least the usage window of remaining life.
//! The margin is a tuning knob, not a correctness requirement (a late
//! expiry only costs one extra remote call), but the hard invariant *is*
//! enforced: a record past its `expires_at` is never handed out.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use depfleet_common::CredentialError;

use crate::cache::StaleCache;
use crate::installations::InstallationDirectory;
use crate::platform::GithubAppApi;

/// A cached installation token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Short SHA-256 digest for logging; raw tokens never hit the logs.
    pub fn digest(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        let mut out = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// Mints and caches per-installation access tokens.
pub struct TokenIssuer {
    cache: StaleCache<String, TokenRecord>,
    directory: Arc<InstallationDirectory>,
}

impl TokenIssuer {
    /// `validity` is the lifetime requested from the platform;
    /// `usage_window` is the margin reserved for consumers. Configuration
    /// guarantees `usage_window < validity`.
    pub fn new(
        api: Arc<dyn GithubAppApi>,
        directory: Arc<InstallationDirectory>,
        validity: Duration,
        usage_window: Duration,
    ) -> Self {
        let max_age = validity.saturating_sub(usage_window).max(Duration::from_secs(1));
        let cache = StaleCache::new(max_age, move |key: String| {
            let api = Arc::clone(&api);
            async move { mint(api.as_ref(), &key, validity).await }
        });
        Self { cache, directory }
    }

    /// A valid access token for whichever installation owns `repository`.
    pub async fn token(&self, epoch: &str, repository: &str) -> Result<TokenRecord, CredentialError> {
        let installation_id = self.directory.owner_of(epoch, repository).await?;
        let key = cache_key(installation_id);

        let record = self.cache.get(key.clone()).await?;
        if !record.is_expired_at(Utc::now()) {
            return Ok(record);
        }

        // A stale read can outlive the remote expiry when background
        // refreshes kept failing; drop the entry and block on a fresh mint
        // rather than hand out a dead token.
        debug!(
            installation_id,
            token = %record.digest(),
            "cached token past expiry; forcing re-mint"
        );
        self.cache.invalidate(&key).await;
        let fresh = self.cache.get(key).await?;
        if fresh.is_expired_at(Utc::now()) {
            return Err(CredentialError::Transient(format!(
                "remote returned an already-expired token for installation {installation_id}"
            )));
        }
        Ok(fresh)
    }
}

fn cache_key(installation_id: u64) -> String {
    format!("installation:{installation_id}")
}

/// Cache refresh function: exchange the installation identity for a new
/// token. The recorded expiry is the earlier of the remote-reported expiry
/// and `now + validity`.
async fn mint(
    api: &dyn GithubAppApi,
    key: &str,
    validity: Duration,
) -> Result<TokenRecord, CredentialError> {
    let installation_id: u64 = key
        .strip_prefix("installation:")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| {
            CredentialError::MalformedCredential(format!("unparsable token cache key {key:?}"))
        })?;

    let minted = api.create_installation_token(installation_id).await?;
    let local_cap = Utc::now()
        + ChronoDuration::from_std(validity).unwrap_or_else(|_| ChronoDuration::hours(1));

    let record = TokenRecord {
        token: minted.token,
        expires_at: minted.expires_at.min(local_cap),
    };
    debug!(
        installation_id,
        token = %record.digest(),
        expires_at = %record.expires_at,
        "minted installation token"
    );
    Ok(record)
}

// =========================================================================
// Tests
// =========================================================================
