//! REST surface consumed from the installable-application platform.
//!
//! Only the operations the credential logic depends on are modeled: token
//! issuance, installation/repository listing, and default-branch lookup.
//! Everything else about the platform's API is out of scope and stays
//! behind implementations of [`GithubAppApi`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use depfleet_common::CredentialError;

/// A token freshly minted against the remote platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    pub token: String,
    /// Expiry as reported by the remote platform.
    pub expires_at: DateTime<Utc>,
}

/// The application-platform operations the credential logic consumes.
#[async_trait]
pub trait GithubAppApi: Send + Sync {
    /// Enumerate all installation ids of the application.
    async fn list_installations(&self) -> Result<Vec<u64>, CredentialError>;

    /// Enumerate every repository (`owner/name`) an installation can
    /// access. Implementations handle pagination internally.
    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<String>, CredentialError>;

    /// Exchange the application identity for a new per-installation access
    /// token.
    async fn create_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<MintedToken, CredentialError>;

    /// Default branch of a repository, looked up with an installation
    /// token.
    async fn default_branch(
        &self,
        token: &str,
        repository: &str,
    ) -> Result<String, CredentialError>;
}

/// Normalize a repository path for exact matching: trim slashes and reduce
/// to the trailing `owner/name` pair (dropping a host prefix such as
/// `github.com/`), lowercased.
pub fn normalize_repository(repository: &str) -> String {
    let trimmed = repository.trim_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    let tail = if segments.len() > 2 {
        segments[segments.len() - 2..].join("/")
    } else {
        segments.join("/")
    };
    tail.to_ascii_lowercase()
}
