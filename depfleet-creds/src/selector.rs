//! Static-credential selection for the static-token platform.
//!
//! Operator-managed credential secrets are low-cardinality and may change
//! under the daemon's feet, so candidates are read fresh from the object
//! store on every lookup; there is no cache. Scoring is a pure function over the
//! candidate list so it stays trivially unit-testable:
//!
//! 1. A pattern exactly equal to the repository wins immediately.
//! 2. Among trailing-`*` patterns whose prefix segments all match, the
//!    highest matching-segment count wins; ties go to the first candidate
//!    encountered.
//! 3. Candidates with no pattern at all apply only when nothing scoped
//!    matched; the first one wins.

use std::sync::Arc;
use tracing::warn;

use depfleet_common::{CredentialError, Labels, ObjectStore, Secret};

/// Read-only snapshot of one stored static credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCredentialCandidate {
    pub host: String,
    /// Path globs; a trailing `*` denotes a path-prefix wildcard. Empty
    /// means host-scoped only.
    pub repository_scopes: Vec<String>,
    pub username: String,
    pub secret_value: String,
}

/// Pick the best candidate for `repository` on `host`.
///
/// Fails `NotFound` when no candidate is scoped to the host at all, and
/// when none of the host's candidates matches the repository.
pub fn select_candidate<'a>(
    candidates: &'a [StaticCredentialCandidate],
    host: &str,
    repository: &str,
) -> Result<&'a StaticCredentialCandidate, CredentialError> {
    let scoped: Vec<&StaticCredentialCandidate> = candidates
        .iter()
        .filter(|c| c.host == host && !c.secret_value.is_empty())
        .collect();
    if scoped.is_empty() {
        return Err(CredentialError::NotFound(format!(
            "no static credential scoped to host {host}"
        )));
    }

    let repo = repository.trim_matches('/');
    let repo_segments: Vec<&str> = repo.split('/').filter(|s| !s.is_empty()).collect();

    let mut best: Option<(&StaticCredentialCandidate, usize)> = None;
    for candidate in scoped.iter().copied() {
        for pattern in &candidate.repository_scopes {
            let pattern = pattern.trim_matches('/');
            if pattern == repo {
                return Ok(candidate);
            }
            let Some(prefix) = pattern.strip_suffix('*') else {
                continue;
            };
            let prefix_segments: Vec<&str> =
                prefix.split('/').filter(|s| !s.is_empty()).collect();
            if prefix_segments.len() > repo_segments.len() {
                continue;
            }
            let matches = prefix_segments
                .iter()
                .zip(repo_segments.iter())
                .all(|(a, b)| a == b);
            if !matches {
                continue;
            }
            let count = prefix_segments.len();
            // Strictly-greater keeps the first-encountered winner on ties.
            if best.is_none_or(|(_, best_count)| count > best_count) {
                best = Some((candidate, count));
            }
        }
    }
    if let Some((winner, _)) = best {
        return Ok(winner);
    }

    scoped
        .iter()
        .find(|c| c.repository_scopes.is_empty())
        .copied()
        .ok_or_else(|| {
            CredentialError::NotFound(format!(
                "no static credential matches {repository} on {host}"
            ))
        })
}

/// Data keys of an operator-managed static credential secret.
const HOST_KEY: &str = "host";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const SCOPES_KEY: &str = "repositories";

/// Parse a stored secret into a candidate.
pub fn candidate_from_secret(secret: &Secret) -> Result<StaticCredentialCandidate, CredentialError> {
    let host = secret.data.get(HOST_KEY).cloned().ok_or_else(|| {
        CredentialError::MalformedCredential(format!("secret {} is missing `host`", secret.name))
    })?;
    let username = secret.data.get(USERNAME_KEY).cloned().ok_or_else(|| {
        CredentialError::MalformedCredential(format!(
            "secret {} is missing `username`",
            secret.name
        ))
    })?;
    let secret_value = secret.data.get(PASSWORD_KEY).cloned().unwrap_or_default();
    let repository_scopes = secret
        .data
        .get(SCOPES_KEY)
        .map(|raw| {
            raw.split([',', '\n'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(StaticCredentialCandidate {
        host,
        repository_scopes,
        username,
        secret_value,
    })
}

/// Fetches candidates from the object store and selects per
/// [`select_candidate`]. Credentials are operator-managed, so a malformed
/// secret is skipped with a prominent log line instead of failing every
/// lookup on the host.
pub struct StaticCredentialSource {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    selector: Labels,
}

impl StaticCredentialSource {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>, selector: Labels) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            selector,
        }
    }

    /// Select the best stored credential for `repository` on `host`,
    /// reading the candidate set fresh from the store.
    pub async fn select(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<StaticCredentialCandidate, CredentialError> {
        let secrets = self
            .store
            .list_secrets(&self.namespace, &self.selector)
            .await
            .map_err(CredentialError::from)?;

        let mut candidates = Vec::with_capacity(secrets.len());
        for secret in &secrets {
            match candidate_from_secret(secret) {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => warn!(
                    secret = %secret.name,
                    error = %err,
                    "skipping malformed static credential"
                ),
            }
        }

        select_candidate(&candidates, host, repository).map(Clone::clone)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use depfleet_common::{LABEL_CREDENTIAL, MemoryStore, test_guard};
    use std::collections::BTreeMap;

    fn candidate(host: &str, scopes: &[&str], username: &str, value: &str) -> StaticCredentialCandidate {
        StaticCredentialCandidate {
            host: host.to_string(),
            repository_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            username: username.to_string(),
            secret_value: value.to_string(),
        }
    }

    #[test]
    fn exact_pattern_beats_wildcard_and_host_only() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &[], "fallback", "pw1"),
            candidate("gitea.internal", &["org/*"], "wildcard", "pw2"),
            candidate("gitea.internal", &["org/repo"], "exact", "pw3"),
        ];

        let winner = select_candidate(&candidates, "gitea.internal", "org/repo").unwrap();
        assert_eq!(winner.username, "exact");
    }

    #[test]
    fn wildcard_wins_for_sibling_repository() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["org/repo"], "exact", "pw1"),
            candidate("gitea.internal", &["org/*"], "wildcard", "pw2"),
            candidate("gitea.internal", &[], "fallback", "pw3"),
        ];

        let winner = select_candidate(&candidates, "gitea.internal", "org/other").unwrap();
        assert_eq!(winner.username, "wildcard");
    }

    #[test]
    fn deeper_wildcard_prefix_wins() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["org/*"], "shallow", "pw1"),
            candidate("gitea.internal", &["org/team/*"], "deep", "pw2"),
        ];

        let winner =
            select_candidate(&candidates, "gitea.internal", "org/team/service").unwrap();
        assert_eq!(winner.username, "deep");
    }

    #[test]
    fn wildcard_ties_break_by_first_encountered() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["org/*"], "first", "pw1"),
            candidate("gitea.internal", &["org/*"], "second", "pw2"),
        ];

        let winner = select_candidate(&candidates, "gitea.internal", "org/thing").unwrap();
        assert_eq!(winner.username, "first");
    }

    #[test]
    fn bare_wildcard_matches_everything_with_lowest_score() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["*"], "catch-all", "pw1"),
            candidate("gitea.internal", &["org/*"], "scoped", "pw2"),
        ];

        let scoped = select_candidate(&candidates, "gitea.internal", "org/thing").unwrap();
        assert_eq!(scoped.username, "scoped");

        let fallback = select_candidate(&candidates, "gitea.internal", "elsewhere/thing").unwrap();
        assert_eq!(fallback.username, "catch-all");
    }

    #[test]
    fn host_only_used_when_nothing_scoped_matches() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["org/*"], "wildcard", "pw1"),
            candidate("gitea.internal", &[], "host-only-1", "pw2"),
            candidate("gitea.internal", &[], "host-only-2", "pw3"),
        ];

        let winner = select_candidate(&candidates, "gitea.internal", "other/repo").unwrap();
        assert_eq!(winner.username, "host-only-1");
    }

    #[test]
    fn different_host_is_not_found() {
        let _guard = test_guard!();
        let candidates = vec![candidate("gitea.internal", &["org/repo"], "x", "pw")];

        let err = select_candidate(&candidates, "gitea.example.com", "org/repo").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_secret_value_is_filtered_out() {
        let _guard = test_guard!();
        let candidates = vec![
            candidate("gitea.internal", &["org/repo"], "empty", ""),
            candidate("gitea.internal", &["org/*"], "usable", "pw"),
        ];

        let winner = select_candidate(&candidates, "gitea.internal", "org/repo").unwrap();
        assert_eq!(winner.username, "usable");
    }

    #[test]
    fn no_match_on_host_is_not_found() {
        let _guard = test_guard!();
        let candidates = vec![candidate("gitea.internal", &["org/*"], "x", "pw")];

        let err = select_candidate(&candidates, "gitea.internal", "elsewhere/repo").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn candidate_parsing_reads_all_keys() {
        let _guard = test_guard!();
        let secret = Secret {
            name: "cred-1".to_string(),
            namespace: "depfleet".to_string(),
            labels: Labels::new(),
            data: BTreeMap::from([
                ("host".to_string(), "gitea.internal".to_string()),
                ("username".to_string(), "updater".to_string()),
                ("password".to_string(), "pw".to_string()),
                ("repositories".to_string(), "org/repo, org/infra/*\nteam/tool".to_string()),
            ]),
        };

        let candidate = candidate_from_secret(&secret).unwrap();
        assert_eq!(candidate.host, "gitea.internal");
        assert_eq!(
            candidate.repository_scopes,
            vec!["org/repo", "org/infra/*", "team/tool"]
        );
    }

    #[test]
    fn candidate_missing_host_is_malformed() {
        let _guard = test_guard!();
        let secret = Secret {
            name: "cred-broken".to_string(),
            namespace: "depfleet".to_string(),
            labels: Labels::new(),
            data: BTreeMap::from([("username".to_string(), "updater".to_string())]),
        };

        let err = candidate_from_secret(&secret).unwrap_err();
        assert_eq!(err.kind(), "malformed_credential");
    }

    fn credential_secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            name: name.to_string(),
            namespace: "depfleet".to_string(),
            labels: Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())]),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn source_reads_fresh_candidates_each_call() {
        let _guard = test_guard!();
        let store = MemoryStore::shared();
        let selector = Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())]);
        let source = StaticCredentialSource::new(store.clone(), "depfleet", selector);

        // No candidates yet.
        let err = source.select("gitea.internal", "org/repo").await.unwrap_err();
        assert!(err.is_not_found());

        // Operator adds a credential; the very next lookup sees it.
        use depfleet_common::ObjectStore as _;
        store
            .create_secret(credential_secret(
                "cred-1",
                &[
                    ("host", "gitea.internal"),
                    ("username", "updater"),
                    ("password", "pw"),
                    ("repositories", "org/*"),
                ],
            ))
            .await
            .unwrap();

        let winner = source.select("gitea.internal", "org/repo").await.unwrap();
        assert_eq!(winner.username, "updater");
    }

    #[tokio::test]
    async fn source_skips_malformed_secrets() {
        let _guard = test_guard!();
        let store = MemoryStore::shared();
        let selector = Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())]);
        let source = StaticCredentialSource::new(store.clone(), "depfleet", selector);

        use depfleet_common::ObjectStore as _;
        store
            .create_secret(credential_secret("cred-broken", &[("username", "x")]))
            .await
            .unwrap();
        store
            .create_secret(credential_secret(
                "cred-ok",
                &[
                    ("host", "gitea.internal"),
                    ("username", "updater"),
                    ("password", "pw"),
                ],
            ))
            .await
            .unwrap();

        let winner = source.select("gitea.internal", "any/repo").await.unwrap();
        assert_eq!(winner.username, "updater");
    }

    mod scoring_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The selected wildcard's prefix is always a real path prefix
            /// of the repository.
            #[test]
            fn winner_prefix_is_prefix_of_repository(
                owner in "[a-z]{1,8}",
                name in "[a-z]{1,8}",
            ) {
                let repo = format!("{owner}/{name}");
                let candidates = vec![
                    candidate("h", &[&format!("{owner}/*")], "scoped", "pw"),
                    candidate("h", &["zzz/*"], "other", "pw"),
                ];
                let winner = select_candidate(&candidates, "h", &repo).unwrap();
                prop_assert_eq!(winner.username.as_str(), "scoped");
            }

            /// An exact pattern always beats any wildcard, regardless of
            /// candidate order.
            #[test]
            fn exact_always_beats_wildcard(flip in any::<bool>()) {
                let exact = candidate("h", &["org/repo"], "exact", "pw");
                let wild = candidate("h", &["org/*"], "wild", "pw");
                let candidates = if flip {
                    vec![exact.clone(), wild.clone()]
                } else {
                    vec![wild, exact]
                };
                let winner = select_candidate(&candidates, "h", "org/repo").unwrap();
                prop_assert_eq!(winner.username.as_str(), "exact");
            }
        }
    }
}
