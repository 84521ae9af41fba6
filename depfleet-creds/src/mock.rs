//! Scripted in-process platform API for tests and the daemon's dev mode.
//!
//! [`MockAppApi`] answers the same surface as the real REST client without
//! the network: installations and their repositories are configured up
//! front, token minting is counted and can be forced to fail, and every
//! operation is observable through call counters.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use depfleet_common::CredentialError;

use crate::platform::{GithubAppApi, MintedToken};

/// One scripted installation: either a repository list or the error its
/// listing call should produce.
type ListingResult = Result<Vec<String>, CredentialError>;

/// In-memory [`GithubAppApi`] with observable call counts.
pub struct MockAppApi {
    installations: Mutex<BTreeMap<u64, ListingResult>>,
    default_branches: Mutex<BTreeMap<String, String>>,
    mint_failure: Mutex<Option<CredentialError>>,
    token_ttl: ChronoDuration,
    discovery_calls: AtomicUsize,
    token_calls: AtomicUsize,
}

impl Default for MockAppApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAppApi {
    pub fn new() -> Self {
        Self {
            installations: Mutex::new(BTreeMap::new()),
            default_branches: Mutex::new(BTreeMap::new()),
            mint_failure: Mutex::new(None),
            token_ttl: ChronoDuration::hours(1),
            discovery_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
        }
    }

    /// Remote-reported token lifetime (default one hour).
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_installation(self, id: u64, repositories: &[&str]) -> Self {
        self.installations.lock().expect("mock lock").insert(
            id,
            Ok(repositories.iter().map(|r| r.to_string()).collect()),
        );
        self
    }

    /// Script the repository-listing call for `id` to fail.
    #[must_use]
    pub fn with_listing_error(self, id: u64, error: CredentialError) -> Self {
        self.installations
            .lock()
            .expect("mock lock")
            .insert(id, Err(error));
        self
    }

    #[must_use]
    pub fn with_default_branch(self, repository: &str, branch: &str) -> Self {
        self.default_branches
            .lock()
            .expect("mock lock")
            .insert(repository.to_string(), branch.to_string());
        self
    }

    /// Force every subsequent mint to fail with `error` (cleared with
    /// [`clear_mint_failure`](Self::clear_mint_failure)).
    pub fn set_mint_failure(&self, error: CredentialError) {
        *self.mint_failure.lock().expect("mock lock") = Some(error);
    }

    pub fn clear_mint_failure(&self) {
        *self.mint_failure.lock().expect("mock lock") = None;
    }

    /// How many discovery sweeps (installation listings) have run.
    pub fn discovery_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    /// How many tokens have been minted.
    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GithubAppApi for MockAppApi {
    async fn list_installations(&self) -> Result<Vec<u64>, CredentialError> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .installations
            .lock()
            .expect("mock lock")
            .keys()
            .copied()
            .collect())
    }

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<String>, CredentialError> {
        self.installations
            .lock()
            .expect("mock lock")
            .get(&installation_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn create_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<MintedToken, CredentialError> {
        if let Some(failure) = self.mint_failure.lock().expect("mock lock").clone() {
            return Err(failure);
        }
        let call = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MintedToken {
            token: format!("ghs_mock_{installation_id}_{call}"),
            expires_at: Utc::now() + self.token_ttl,
        })
    }

    async fn default_branch(
        &self,
        _token: &str,
        repository: &str,
    ) -> Result<String, CredentialError> {
        Ok(self
            .default_branches
            .lock()
            .expect("mock lock")
            .get(repository)
            .cloned()
            .unwrap_or_else(|| "main".to_string()))
    }
}
