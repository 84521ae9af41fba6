//! Common types used across Depfleet components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::PipelineSpec;

/// Label carrying the Depfleet component that owns an object.
pub const LABEL_COMPONENT: &str = "depfleet/component";
/// Label carrying the hosting platform an execution targets.
pub const LABEL_PLATFORM: &str = "depfleet/platform";
/// Label carrying the hosting platform's host name.
pub const LABEL_HOST: &str = "depfleet/host";
/// Label carrying the repository an execution pod is updating.
pub const LABEL_REPOSITORY: &str = "depfleet/repository";
/// Label linking an execution pod back to its `QueuedExecution`.
pub const LABEL_EXECUTION: &str = "depfleet/execution";
/// Label marking a secret as an operator-managed static credential.
pub const LABEL_CREDENTIAL: &str = "depfleet/credential";

/// Component label value for rendered update runs.
pub const COMPONENT_UPDATE_RUN: &str = "update-run";
/// The single data key a rendered credential secret holds.
pub const TOKEN_DATA_KEY: &str = "token";
/// The data key the rendered config object stores the task payload under.
pub const TASKS_DATA_KEY: &str = "tasks";

/// Hosting platform a repository lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Installable-application model: per-installation access tokens.
    Github,
    /// Static-token model: operator-managed personal access tokens.
    Gitea,
}

impl Platform {
    /// Stable label value for this platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitea => "gitea",
        }
    }

    /// Parse a label value back into a platform.
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "github" => Some(Self::Github),
            "gitea" => Some(Self::Gitea),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One target repository inside an [`ExecutionTask`].
///
/// Base branches keep insertion order; duplicates are rejected so a branch
/// never appears twice in a rendered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Repository path (`owner/name`, possibly host-prefixed).
    pub repository: String,
    /// Branches the update run targets for this repository.
    #[serde(default)]
    pub base_branches: Vec<String>,
}

impl RepositoryRef {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            base_branches: Vec::new(),
        }
    }

    /// Add a base branch, returning `false` when it is already present.
    pub fn add_base_branch(&mut self, branch: impl Into<String>) -> bool {
        let branch = branch.into();
        if self.base_branches.iter().any(|b| *b == branch) {
            return false;
        }
        self.base_branches.push(branch);
        true
    }
}

/// Credential + target bundle rendered into one update run.
///
/// Mutable only while the trigger is still assembling it; once the execution
/// objects are created the task is never touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub platform: Platform,
    pub username: String,
    pub git_author: String,
    pub token: String,
    pub api_endpoint: String,
    /// Target repositories in insertion order.
    pub repositories: Vec<RepositoryRef>,
}

impl ExecutionTask {
    /// Merge a repository/branch pair into the task.
    ///
    /// A repository already present (same credential bundle) gains the new
    /// branch instead of producing a second entry, so shared credentials
    /// yield one execution per repository rather than one per branch.
    pub fn add_repository(&mut self, repository: &str, base_branch: &str) {
        if let Some(existing) = self
            .repositories
            .iter_mut()
            .find(|r| r.repository == repository)
        {
            existing.add_base_branch(base_branch);
            return;
        }
        let mut entry = RepositoryRef::new(repository);
        entry.add_base_branch(base_branch);
        self.repositories.push(entry);
    }

    /// JSON payload written into the rendered config object.
    ///
    /// The token travels in the execution's secret, never in the config
    /// payload; everything else in the bundle is included verbatim.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "platform": self.platform,
            "username": self.username,
            "git_author": self.git_author,
            "api_endpoint": self.api_endpoint,
            "repositories": self.repositories,
        })
    }
}

/// Lifecycle of a queued update run.
///
/// `Pending` is the only non-terminal predecessor state; `Active` is entered
/// exactly once, and terminal states are never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status ends the execution's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One unit of rendered work submitted to the pipeline-execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedExecution {
    pub name: String,
    pub namespace: String,
    pub creation_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Rendered pipeline definition handed to the execution engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PipelineSpec>,
    /// Reason attached when the execution was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Set by the execution engine when a terminal status is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedExecution {
    /// Create a Pending execution stamped with the current time.
    pub fn pending(
        name: impl Into<String>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            creation_time: Utc::now(),
            status: ExecutionStatus::Pending,
            labels,
            spec: None,
            failure_reason: None,
            completed_at: None,
        }
    }

    /// Attempt a status transition, returning `false` when it is illegal.
    ///
    /// Legal moves are Pending -> Active and Pending/Active -> terminal.
    /// Terminal states accept nothing.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        let legal = match (self.status, next) {
            (ExecutionStatus::Pending, ExecutionStatus::Active) => true,
            (ExecutionStatus::Pending | ExecutionStatus::Active, n) if n.is_terminal() => true,
            _ => false,
        };
        if legal {
            self.status = next;
            if next.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        }
        legal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_ref_rejects_duplicate_branches() {
        let mut repo = RepositoryRef::new("acme/widgets");
        assert!(repo.add_base_branch("main"));
        assert!(repo.add_base_branch("release-1.x"));
        assert!(!repo.add_base_branch("main"));
        assert_eq!(repo.base_branches, vec!["main", "release-1.x"]);
    }

    fn task() -> ExecutionTask {
        ExecutionTask {
            platform: Platform::Github,
            username: "depfleet[bot]".to_string(),
            git_author: "Depfleet Bot <bot@depfleet.io>".to_string(),
            token: "ghs_secret".to_string(),
            api_endpoint: "https://api.github.com".to_string(),
            repositories: Vec::new(),
        }
    }

    #[test]
    fn task_merges_branches_for_shared_credential() {
        let mut task = task();
        task.add_repository("acme/widgets", "main");
        task.add_repository("acme/gadgets", "main");
        task.add_repository("acme/widgets", "release-1.x");
        task.add_repository("acme/widgets", "main");

        assert_eq!(task.repositories.len(), 2);
        assert_eq!(task.repositories[0].repository, "acme/widgets");
        assert_eq!(task.repositories[0].base_branches, vec!["main", "release-1.x"]);
        assert_eq!(task.repositories[1].repository, "acme/gadgets");
    }

    #[test]
    fn task_payload_omits_token() {
        let mut task = task();
        task.add_repository("acme/widgets", "main");

        let payload = task.payload();
        assert_eq!(payload["platform"], "github");
        assert_eq!(payload["repositories"][0]["repository"], "acme/widgets");
        assert!(payload.get("token").is_none());
        assert!(!payload.to_string().contains("ghs_secret"));
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        let mut execution =
            QueuedExecution::pending("update-github-1", "updates", BTreeMap::new());

        assert!(!execution.transition(ExecutionStatus::Pending));
        assert!(execution.transition(ExecutionStatus::Active));
        assert_eq!(execution.status, ExecutionStatus::Active);

        // Active is entered exactly once.
        assert!(!execution.transition(ExecutionStatus::Active));

        assert!(execution.transition(ExecutionStatus::Succeeded));
        assert!(execution.completed_at.is_some());

        // Terminal states are never re-entered or left.
        assert!(!execution.transition(ExecutionStatus::Failed));
        assert!(!execution.transition(ExecutionStatus::Active));
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn pending_may_terminate_without_activation() {
        let mut execution = QueuedExecution::pending("update-gitea-1", "updates", BTreeMap::new());
        assert!(execution.transition(ExecutionStatus::Cancelled));
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn platform_label_round_trip() {
        assert_eq!(Platform::from_label("github"), Some(Platform::Github));
        assert_eq!(Platform::from_label("gitea"), Some(Platform::Gitea));
        assert_eq!(Platform::from_label("bitbucket"), None);
        assert_eq!(Platform::Gitea.to_string(), "gitea");
    }
}
