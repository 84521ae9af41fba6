//! Installation discovery for the installable-application platform.
//!
//! One discovery sweep authenticates as the application, enumerates its
//! installations, and collects the repositories each installation can
//! access. The whole snapshot is cached as a unit per *epoch* (a token the
//! caller supplies once per trigger cycle), so every lookup inside one
//! cycle shares one snapshot while independent lookups never block each
//! other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use depfleet_common::CredentialError;

use crate::cache::StaleCache;
use crate::platform::{GithubAppApi, normalize_repository};

/// A tenant-scoped grant of the application to a set of repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: u64,
    /// Normalized `owner/name` paths the installation can access.
    pub repositories: BTreeSet<String>,
}

/// Cached directory of installations and the repositories they own.
pub struct InstallationDirectory {
    cache: StaleCache<String, Arc<Vec<Installation>>>,
}

impl InstallationDirectory {
    /// `max_age` bounds how long a discovery snapshot may be served once
    /// its epoch is re-used across cycles.
    pub fn new(api: Arc<dyn GithubAppApi>, max_age: Duration) -> Self {
        let cache = StaleCache::new(max_age, move |epoch: String| {
            let api = Arc::clone(&api);
            async move {
                debug!(epoch = %epoch, "running installation discovery");
                discover(api.as_ref()).await
            }
        });
        Self { cache }
    }

    /// The discovery snapshot for `epoch`, fetched at most once per epoch.
    pub async fn installations(
        &self,
        epoch: &str,
    ) -> Result<Arc<Vec<Installation>>, CredentialError> {
        self.cache.get(epoch.to_string()).await
    }

    /// Which installation owns `repository`.
    ///
    /// Exact match against the normalized snapshot; `NotFound` is terminal
    /// for the repository: no installation grants access to it.
    pub async fn owner_of(&self, epoch: &str, repository: &str) -> Result<u64, CredentialError> {
        let snapshot = self.installations(epoch).await?;
        let needle = normalize_repository(repository);
        snapshot
            .iter()
            .find(|installation| installation.repositories.contains(&needle))
            .map(|installation| installation.id)
            .ok_or_else(|| {
                CredentialError::NotFound(format!("no installation grants access to {needle}"))
            })
    }
}

/// One full discovery sweep.
///
/// An installation whose repository listing fails (e.g. insufficient grant)
/// is kept with zero repositories instead of aborting discovery.
async fn discover(api: &dyn GithubAppApi) -> Result<Arc<Vec<Installation>>, CredentialError> {
    let ids = api.list_installations().await?;
    let mut installations = Vec::with_capacity(ids.len());
    for id in ids {
        let repositories = match api.list_installation_repositories(id).await {
            Ok(repos) => repos
                .iter()
                .map(|repo| normalize_repository(repo))
                .collect(),
            Err(err) => {
                warn!(
                    installation_id = id,
                    error = %err,
                    "repository listing failed; keeping installation with no repositories"
                );
                BTreeSet::new()
            }
        };
        installations.push(Installation { id, repositories });
    }
    Ok(Arc::new(installations))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use depfleet_common::test_guard;

    use crate::mock::MockAppApi;
    use crate::platform::MintedToken;

    fn directory(api: MockAppApi) -> (InstallationDirectory, Arc<MockAppApi>) {
        let api = Arc::new(api);
        let directory = InstallationDirectory::new(
            api.clone() as Arc<dyn GithubAppApi>,
            Duration::from_secs(600),
        );
        (directory, api)
    }

    #[tokio::test]
    async fn owner_of_finds_the_single_owner() {
        let _guard = test_guard!();
        let (directory, _api) = directory(
            MockAppApi::new()
                .with_installation(7, &["acme/widgets", "acme/gadgets"])
                .with_installation(9, &["globex/site"]),
        );

        assert_eq!(directory.owner_of("e1", "acme/widgets").await.unwrap(), 7);
        assert_eq!(directory.owner_of("e1", "globex/site").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn owner_of_normalizes_before_matching() {
        let _guard = test_guard!();
        let (directory, _api) = directory(MockAppApi::new().with_installation(7, &["Acme/Widgets"]));

        assert_eq!(
            directory
                .owner_of("e1", "github.com/acme/widgets")
                .await
                .unwrap(),
            7
        );
        assert_eq!(directory.owner_of("e1", "/acme/widgets/").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn owner_of_unknown_repository_is_not_found() {
        let _guard = test_guard!();
        let (directory, _api) = directory(MockAppApi::new().with_installation(7, &["acme/widgets"]));

        let err = directory
            .owner_of("e1", "acme/nonexistent")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_repository_listing_keeps_installation_empty() {
        let _guard = test_guard!();
        let (directory, _api) = directory(
            MockAppApi::new()
                .with_installation(7, &["acme/widgets"])
                .with_listing_error(
                    9,
                    CredentialError::Unauthorized("grant revoked".to_string()),
                ),
        );

        let snapshot = directory.installations("e1").await.unwrap();
        assert_eq!(snapshot.len(), 2);
        let degraded = snapshot.iter().find(|i| i.id == 9).unwrap();
        assert!(degraded.repositories.is_empty());

        // Discovery still succeeded for the healthy installation.
        assert!(directory.owner_of("e1", "acme/widgets").await.is_ok());
    }

    #[tokio::test]
    async fn lookups_within_one_epoch_share_one_discovery() {
        let _guard = test_guard!();
        let (directory, api) = directory(
            MockAppApi::new().with_installation(7, &["acme/widgets", "acme/gadgets"]),
        );

        directory.owner_of("e1", "acme/widgets").await.unwrap();
        directory.owner_of("e1", "acme/gadgets").await.unwrap();
        directory.installations("e1").await.unwrap();
        assert_eq!(api.discovery_calls(), 1);

        // A new epoch runs a fresh discovery.
        directory.owner_of("e2", "acme/widgets").await.unwrap();
        assert_eq!(api.discovery_calls(), 2);
    }

    #[tokio::test]
    async fn discovery_failure_surfaces_to_caller() {
        let _guard = test_guard!();
        struct Broken;
        #[async_trait]
        impl GithubAppApi for Broken {
            async fn list_installations(&self) -> Result<Vec<u64>, CredentialError> {
                Err(CredentialError::RateLimited("secondary limit".to_string()))
            }
            async fn list_installation_repositories(
                &self,
                _installation_id: u64,
            ) -> Result<Vec<String>, CredentialError> {
                unreachable!("discovery never reaches repository listing")
            }
            async fn create_installation_token(
                &self,
                _installation_id: u64,
            ) -> Result<MintedToken, CredentialError> {
                unreachable!()
            }
            async fn default_branch(
                &self,
                _token: &str,
                _repository: &str,
            ) -> Result<String, CredentialError> {
                unreachable!()
            }
        }

        let directory = InstallationDirectory::new(Arc::new(Broken), Duration::from_secs(600));
        let err = directory.owner_of("e1", "acme/widgets").await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }
}
