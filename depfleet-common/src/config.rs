//! Orchestrator configuration.
//!
//! TOML-backed, with serde defaults on every field so a missing file or a
//! partial file both yield a runnable daemon. Durations are humantime
//! strings (`"1h"`, `"10m"`); invalid combinations fall back to defaults
//! with a warning rather than refusing to start.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::types::Platform;

/// Top-level configuration for the orchestrator daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub gitea: GiteaConfig,
    /// Explicitly configured repositories (required for Gitea, optional
    /// additions for GitHub).
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Namespace all rendered objects live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Cron expression driving the fleet trigger (seconds field included).
    #[serde(default = "default_trigger_schedule")]
    pub trigger_schedule: String,
    /// How often the admission controller re-evaluates the queue.
    #[serde(default = "default_admission_interval")]
    pub admission_interval: String,
    /// Service account rendered into execution definitions.
    #[serde(default = "default_service_account")]
    pub service_account: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            log_level: default_log_level(),
            trigger_schedule: default_trigger_schedule(),
            admission_interval: default_admission_interval(),
            service_account: default_service_account(),
        }
    }
}

impl GeneralConfig {
    /// Parsed admission tick interval, defaulting on unparsable input.
    pub fn admission_tick(&self) -> Duration {
        parse_duration_or(&self.admission_interval, DEFAULT_ADMISSION_INTERVAL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrently Active executions.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: u32,
    /// Repositories bundled into one execution.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: default_concurrency_ceiling(),
            batch_size: default_batch_size(),
        }
    }
}

/// Token lifetime knobs for the installable-application platform.
///
/// The usage window is the margin reserved for an execution to actually use
/// a token: cached tokens are refreshed once `validity - usage_window` has
/// elapsed, so a handed-out token always has at least the usage window left
/// before the remote platform rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_token_validity")]
    pub token_validity: String,
    #[serde(default = "default_token_usage_window")]
    pub token_usage_window: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_validity: default_token_validity(),
            token_usage_window: default_token_usage_window(),
        }
    }
}

impl CredentialConfig {
    /// Resolved `(validity, usage_window)`.
    ///
    /// The usage window must be strictly less than the validity; any other
    /// combination (including unparsable values) falls back to the defaults.
    pub fn token_windows(&self) -> (Duration, Duration) {
        let validity = parse_duration_or(&self.token_validity, DEFAULT_TOKEN_VALIDITY);
        let usage = parse_duration_or(&self.token_usage_window, DEFAULT_TOKEN_USAGE_WINDOW);
        if usage >= validity {
            warn!(
                validity = %self.token_validity,
                usage_window = %self.token_usage_window,
                "token usage window must be shorter than validity; using defaults"
            );
            return (DEFAULT_TOKEN_VALIDITY, DEFAULT_TOKEN_USAGE_WINDOW);
        }
        (validity, usage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_github_endpoint")]
    pub api_endpoint: String,
    /// GitHub App identifier; empty disables the platform.
    #[serde(default)]
    pub app_id: String,
    /// Path to the app's PEM private key.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_github_username")]
    pub username: String,
    #[serde(default = "default_git_author")]
    pub git_author: String,
    /// Enumerate every repository the app's installations grant, in
    /// addition to the explicit repository list.
    #[serde(default = "default_true")]
    pub autodiscover: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_github_endpoint(),
            app_id: String::new(),
            private_key_path: None,
            username: default_github_username(),
            git_author: default_git_author(),
            autodiscover: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiteaConfig {
    /// Host the static credentials are scoped to.
    #[serde(default = "default_gitea_host")]
    pub host: String,
    #[serde(default = "default_gitea_endpoint")]
    pub api_endpoint: String,
    #[serde(default = "default_git_author")]
    pub git_author: String,
    /// Base branch assumed when a repository entry does not configure one.
    #[serde(default = "default_base_branch")]
    pub default_base_branch: String,
}

impl Default for GiteaConfig {
    fn default() -> Self {
        Self {
            host: default_gitea_host(),
            api_endpoint: default_gitea_endpoint(),
            git_author: default_git_author(),
            default_base_branch: default_base_branch(),
        }
    }
}

/// One explicitly configured repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub platform: Platform,
    pub repository: String,
    #[serde(default)]
    pub base_branches: Vec<String>,
}

const DEFAULT_ADMISSION_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TOKEN_USAGE_WINDOW: Duration = Duration::from_secs(10 * 60);

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(value = raw, error = %err, "unparsable duration; using default");
            fallback
        }
    }
}

fn default_namespace() -> String {
    "depfleet".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trigger_schedule() -> String {
    // Every six hours, on the hour.
    "0 0 */6 * * *".to_string()
}

fn default_admission_interval() -> String {
    "15s".to_string()
}

fn default_service_account() -> String {
    "depfleet-runner".to_string()
}

fn default_concurrency_ceiling() -> u32 {
    25
}

fn default_batch_size() -> usize {
    20
}

fn default_token_validity() -> String {
    "1h".to_string()
}

fn default_token_usage_window() -> String {
    "10m".to_string()
}

fn default_github_endpoint() -> String {
    "https://api.github.com".to_string()
}

fn default_github_username() -> String {
    "depfleet[bot]".to_string()
}

fn default_git_author() -> String {
    "Depfleet Bot <bot@depfleet.dev>".to_string()
}

fn default_gitea_host() -> String {
    "gitea.internal".to_string()
}

fn default_gitea_endpoint() -> String {
    "https://gitea.internal/api/v1".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Load configuration from `path`, or from the platform config
    /// directory when no path is given. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(explicit) => explicit.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "depfleet", "depfleet")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
