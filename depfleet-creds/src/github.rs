//! REST client for the GitHub App platform.
//!
//! Implements [`GithubAppApi`] over the three operations the credential
//! logic depends on: installation enumeration, repository listing, and
//! installation-token issuance (plus default-branch lookup for the
//! trigger). Authentication as the application uses a short-lived RS256
//! JWT signed with the app's private key; repository listing uses an
//! installation token minted on the fly.
//!
//! HTTP is blocking (`ureq`) and always runs on the blocking pool;
//! `RateLimited`/`Transient` failures are retried a bounded number of
//! times with jittered exponential backoff before surfacing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use depfleet_common::CredentialError;

use crate::platform::{GithubAppApi, MintedToken, normalize_repository};

const PAGE_SIZE: usize = 100;
const USER_AGENT: &str = "depfleet-creds/github-app-client";
const API_VERSION: &str = "2022-11-28";
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Production [`GithubAppApi`] backed by the platform's REST API.
#[derive(Clone, Debug)]
pub struct GithubAppClient {
    app_id: String,
    private_key: SecretString,
    api_endpoint: String,
}

impl GithubAppClient {
    /// Fails with `MalformedCredential` when the app id or private key is
    /// empty; an unparsable key only fails once a JWT is actually signed.
    pub fn new(
        app_id: impl Into<String>,
        private_key: SecretString,
        api_endpoint: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let app_id = app_id.into();
        if app_id.trim().is_empty() {
            return Err(CredentialError::MalformedCredential(
                "app id must not be empty".to_string(),
            ));
        }
        if private_key.expose_secret().trim().is_empty() {
            return Err(CredentialError::MalformedCredential(
                "app private key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            app_id,
            private_key,
            api_endpoint: api_endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// Sign a short-lived JWT authenticating as the application.
    fn app_jwt(&self) -> Result<String, CredentialError> {
        #[derive(serde::Serialize)]
        struct Claims {
            iat: u64,
            exp: u64,
            iss: String,
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| CredentialError::Transient(format!("system clock: {err}")))?
            .as_secs();
        // Backdate against clock skew; ten minutes is the platform maximum.
        let claims = Claims {
            iat: now.saturating_sub(60),
            exp: now + 540,
            iss: self.app_id.clone(),
        };

        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|err| {
                CredentialError::MalformedCredential(format!("app private key: {err}"))
            })?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| CredentialError::MalformedCredential(format!("app jwt: {err}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_endpoint)
    }

    // ----- blocking request cores -----

    fn list_installations_blocking(&self) -> Result<Vec<u64>, CredentialError> {
        #[derive(Deserialize)]
        struct InstallationEnvelope {
            id: u64,
        }

        let auth = format!("Bearer {}", self.app_jwt()?);
        let mut ids = Vec::new();
        for page in 1.. {
            let url = self.url(&format!("/app/installations?per_page={PAGE_SIZE}&page={page}"));
            let batch: Vec<InstallationEnvelope> = with_retry("list installations", || {
                let mut response = ureq::get(&url)
                    .header("Accept", "application/vnd.github+json")
                    .header("Authorization", auth.as_str())
                    .header("User-Agent", USER_AGENT)
                    .header("X-GitHub-Api-Version", API_VERSION)
                    .call()
                    .map_err(|err| map_http_error("list installations", err))?;
                response
                    .body_mut()
                    .read_json()
                    .map_err(|err| map_http_error("list installations", err))
            })?;
            let done = batch.len() < PAGE_SIZE;
            ids.extend(batch.into_iter().map(|envelope| envelope.id));
            if done {
                break;
            }
        }
        Ok(ids)
    }

    fn list_installation_repositories_blocking(
        &self,
        installation_id: u64,
    ) -> Result<Vec<String>, CredentialError> {
        #[derive(Deserialize)]
        struct RepositoryEnvelope {
            full_name: String,
        }
        #[derive(Deserialize)]
        struct RepositoryPage {
            repositories: Vec<RepositoryEnvelope>,
        }

        // Repository listing is scoped to an installation token, not the
        // app JWT.
        let minted = self.create_installation_token_blocking(installation_id)?;
        let auth = format!("Bearer {}", minted.token);
        let mut repositories = Vec::new();
        for page in 1.. {
            let url =
                self.url(&format!("/installation/repositories?per_page={PAGE_SIZE}&page={page}"));
            let batch: RepositoryPage = with_retry("list installation repositories", || {
                let mut response = ureq::get(&url)
                    .header("Accept", "application/vnd.github+json")
                    .header("Authorization", auth.as_str())
                    .header("User-Agent", USER_AGENT)
                    .header("X-GitHub-Api-Version", API_VERSION)
                    .call()
                    .map_err(|err| map_http_error("list installation repositories", err))?;
                response
                    .body_mut()
                    .read_json()
                    .map_err(|err| map_http_error("list installation repositories", err))
            })?;
            let done = batch.repositories.len() < PAGE_SIZE;
            repositories.extend(batch.repositories.into_iter().map(|repo| repo.full_name));
            if done {
                break;
            }
        }
        debug!(
            installation_id,
            repositories = repositories.len(),
            "listed installation repositories"
        );
        Ok(repositories)
    }

    fn create_installation_token_blocking(
        &self,
        installation_id: u64,
    ) -> Result<MintedToken, CredentialError> {
        #[derive(Deserialize)]
        struct TokenEnvelope {
            token: String,
            expires_at: String,
        }

        let auth = format!("Bearer {}", self.app_jwt()?);
        let url = self.url(&format!("/app/installations/{installation_id}/access_tokens"));
        let envelope: TokenEnvelope = with_retry("create installation token", || {
            let mut response = ureq::post(&url)
                .header("Accept", "application/vnd.github+json")
                .header("Authorization", auth.as_str())
                .header("User-Agent", USER_AGENT)
                .header("X-GitHub-Api-Version", API_VERSION)
                .send_empty()
                .map_err(|err| map_http_error("create installation token", err))?;
            response
                .body_mut()
                .read_json()
                .map_err(|err| map_http_error("create installation token", err))
        })?;

        let expires_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&envelope.expires_at)
            .map_err(|err| {
                CredentialError::Transient(format!(
                    "unparsable token expiry {:?}: {err}",
                    envelope.expires_at
                ))
            })?
            .with_timezone(&Utc);

        Ok(MintedToken {
            token: envelope.token,
            expires_at,
        })
    }

    fn default_branch_blocking(
        &self,
        token: &str,
        repository: &str,
    ) -> Result<String, CredentialError> {
        #[derive(Deserialize)]
        struct RepositoryInfo {
            default_branch: String,
        }

        let repository = normalize_repository(repository);
        let url = self.url(&format!("/repos/{repository}"));
        let auth = format!("Bearer {token}");
        let info: RepositoryInfo = with_retry("default branch lookup", || {
            let mut response = ureq::get(&url)
                .header("Accept", "application/vnd.github+json")
                .header("Authorization", auth.as_str())
                .header("User-Agent", USER_AGENT)
                .header("X-GitHub-Api-Version", API_VERSION)
                .call()
                .map_err(|err| map_http_error("default branch lookup", err))?;
            response
                .body_mut()
                .read_json()
                .map_err(|err| map_http_error("default branch lookup", err))
        })?;
        Ok(info.default_branch)
    }
}

#[async_trait]
impl GithubAppApi for GithubAppClient {
    async fn list_installations(&self) -> Result<Vec<u64>, CredentialError> {
        let client = self.clone();
        run_blocking(move || client.list_installations_blocking()).await
    }

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<String>, CredentialError> {
        let client = self.clone();
        run_blocking(move || client.list_installation_repositories_blocking(installation_id)).await
    }

    async fn create_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<MintedToken, CredentialError> {
        let client = self.clone();
        run_blocking(move || client.create_installation_token_blocking(installation_id)).await
    }

    async fn default_branch(
        &self,
        token: &str,
        repository: &str,
    ) -> Result<String, CredentialError> {
        let client = self.clone();
        let token = token.to_string();
        let repository = repository.to_string();
        run_blocking(move || client.default_branch_blocking(&token, &repository)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, CredentialError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CredentialError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| CredentialError::Transient(format!("blocking task join: {err}")))?
}

/// Retry retryable failures with jittered exponential backoff. Runs on the
/// blocking pool, so sleeping the thread is fine.
fn with_retry<T>(
    context: &str,
    mut operation: impl FnMut() -> Result<T, CredentialError>,
) -> Result<T, CredentialError> {
    let mut attempt = 0;
    loop {
        match operation() {
            Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let jitter_ms: u64 = rand::rng().random_range(0..250);
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1) + Duration::from_millis(jitter_ms);
                warn!(
                    context,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "retrying platform call"
                );
                std::thread::sleep(backoff);
            }
            other => return other,
        }
    }
}

fn map_http_error(context: &str, err: ureq::Error) -> CredentialError {
    match err {
        ureq::Error::StatusCode(code) => classify_status(context, code),
        other => CredentialError::Transient(format!("{context}: {other}")),
    }
}

/// Map a platform HTTP status onto an error kind. Rate limiting surfaces as
/// 403 (secondary limits) or 429 on this platform.
fn classify_status(context: &str, code: u16) -> CredentialError {
    match code {
        401 => CredentialError::Unauthorized(format!("{context}: status 401")),
        403 | 429 => CredentialError::RateLimited(format!("{context}: status {code}")),
        404 => CredentialError::NotFound(format!("{context}: status 404")),
        500..=599 => CredentialError::Transient(format!("{context}: status {code}")),
        other => CredentialError::Transient(format!("{context}: unexpected status {other}")),
    }
}

// =========================================================================
// Tests
// =========================================================================
