//! Fleet-wide trigger: the periodic sweep that renders update runs.
//!
//! One run enumerates eligible repositories (GitHub installations are
//! auto-discovered; Gitea repositories come from configuration), resolves a
//! credential per repository, and bundles repositories sharing a credential
//! into [`ExecutionTask`]s: one execution per batch, not one per branch or
//! repository. Each batch is rendered as a token secret (single `token`
//! key), a config object holding the task payload, and a Pending execution
//! for the admission controller to promote.
//!
//! A credential failure for one repository is recorded against that
//! repository only; the sweep always continues.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use depfleet_common::{
    COMPONENT_UPDATE_RUN, ConfigObject, ExecutionTask, LABEL_COMPONENT, LABEL_HOST,
    LABEL_PLATFORM, Labels, ObjectStore, OrchestratorConfig, PipelineBuilder, Platform,
    QueuedExecution, RepositoryEntry, Secret, StoreError, TASKS_DATA_KEY, TOKEN_DATA_KEY,
};
use depfleet_creds::{
    GithubAppApi, InstallationDirectory, StaticCredentialSource, TokenIssuer,
    normalize_repository,
};

use crate::events::EventBus;

// =========================================================================
// Configuration
// =========================================================================

/// The slice of daemon configuration the trigger needs.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub namespace: String,
    pub batch_size: usize,
    pub service_account: String,
    pub github_api_endpoint: String,
    pub github_username: String,
    pub github_git_author: String,
    pub github_autodiscover: bool,
    pub gitea_host: String,
    pub gitea_api_endpoint: String,
    pub gitea_git_author: String,
    pub gitea_default_branch: String,
    pub repositories: Vec<RepositoryEntry>,
}

impl TriggerConfig {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            namespace: config.general.namespace.clone(),
            batch_size: config.limits.batch_size.max(1),
            service_account: config.general.service_account.clone(),
            github_api_endpoint: config.github.api_endpoint.clone(),
            github_username: config.github.username.clone(),
            github_git_author: config.github.git_author.clone(),
            github_autodiscover: config.github.autodiscover,
            gitea_host: config.gitea.host.clone(),
            gitea_api_endpoint: config.gitea.api_endpoint.clone(),
            gitea_git_author: config.gitea.git_author.clone(),
            gitea_default_branch: config.gitea.default_base_branch.clone(),
            repositories: config.repositories.clone(),
        }
    }
}

/// What one sweep accomplished.
#[derive(Debug, Default)]
pub struct TriggerSummary {
    pub executions_created: usize,
    pub repositories_processed: usize,
    /// `(repository, reason)` for every repository that failed credential
    /// resolution; never aborts the sweep.
    pub failures: Vec<(String, String)>,
}

// =========================================================================
// Trigger
// =========================================================================

/// Renders queued update runs for the whole fleet.
pub struct FleetTrigger {
    store: Arc<dyn ObjectStore>,
    api: Arc<dyn GithubAppApi>,
    directory: Arc<InstallationDirectory>,
    issuer: Arc<TokenIssuer>,
    statics: Arc<StaticCredentialSource>,
    events: EventBus,
    config: TriggerConfig,
}

impl FleetTrigger {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        api: Arc<dyn GithubAppApi>,
        directory: Arc<InstallationDirectory>,
        issuer: Arc<TokenIssuer>,
        statics: Arc<StaticCredentialSource>,
        events: EventBus,
        config: TriggerConfig,
    ) -> Self {
        Self {
            store,
            api,
            directory,
            issuer,
            statics,
            events,
            config,
        }
    }

    /// Run one fleet sweep. Store failures while rendering abort the sweep
    /// (retried on the next schedule); credential failures never do.
    pub async fn run(&self) -> Result<TriggerSummary, StoreError> {
        // All lookups in this sweep share one discovery snapshot.
        let epoch = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let mut summary = TriggerSummary::default();

        let github_tasks = self.assemble_github_tasks(&epoch, &mut summary).await;
        let gitea_tasks = self.assemble_gitea_tasks(&mut summary).await;

        for task in github_tasks.values().chain(gitea_tasks.values()) {
            for chunk in task.repositories.chunks(self.config.batch_size) {
                let batch = ExecutionTask {
                    repositories: chunk.to_vec(),
                    ..task.clone()
                };
                self.render_execution(&batch).await?;
                summary.executions_created += 1;
            }
        }

        info!(
            executions = summary.executions_created,
            repositories = summary.repositories_processed,
            failures = summary.failures.len(),
            "fleet trigger sweep finished"
        );
        self.events.emit(
            "trigger_completed",
            &json!({
                "executions": summary.executions_created,
                "repositories": summary.repositories_processed,
                "failures": summary.failures.len(),
            }),
        );
        Ok(summary)
    }

    /// Gather GitHub targets (auto-discovered plus explicit) and group them
    /// into one task per installation, since repositories of one
    /// installation share its token.
    async fn assemble_github_tasks(
        &self,
        epoch: &str,
        summary: &mut TriggerSummary,
    ) -> BTreeMap<u64, ExecutionTask> {
        let mut targets: Vec<(String, Vec<String>)> = Vec::new();
        if self.config.github_autodiscover {
            match self.directory.installations(epoch).await {
                Ok(snapshot) => {
                    for installation in snapshot.iter() {
                        for repository in &installation.repositories {
                            targets.push((repository.clone(), Vec::new()));
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "installation discovery failed; explicit repositories only");
                    summary
                        .failures
                        .push(("<discovery>".to_string(), err.to_string()));
                }
            }
        }
        for entry in &self.config.repositories {
            if entry.platform == Platform::Github {
                targets.push((
                    normalize_repository(&entry.repository),
                    entry.base_branches.clone(),
                ));
            }
        }

        let mut tasks: BTreeMap<u64, ExecutionTask> = BTreeMap::new();
        for (repository, configured_branches) in targets {
            let installation_id = match self.directory.owner_of(epoch, &repository).await {
                Ok(id) => id,
                Err(err) => {
                    self.record_failure(summary, &repository, &err.to_string());
                    continue;
                }
            };
            let record = match self.issuer.token(epoch, &repository).await {
                Ok(record) => record,
                Err(err) => {
                    self.record_failure(summary, &repository, &err.to_string());
                    continue;
                }
            };
            let branches = if configured_branches.is_empty() {
                match self.api.default_branch(&record.token, &repository).await {
                    Ok(branch) => vec![branch],
                    Err(err) => {
                        self.record_failure(summary, &repository, &err.to_string());
                        continue;
                    }
                }
            } else {
                configured_branches
            };

            let task = tasks.entry(installation_id).or_insert_with(|| ExecutionTask {
                platform: Platform::Github,
                username: self.config.github_username.clone(),
                git_author: self.config.github_git_author.clone(),
                token: record.token.clone(),
                api_endpoint: self.config.github_api_endpoint.clone(),
                repositories: Vec::new(),
            });
            let already_known = task.repositories.iter().any(|r| r.repository == repository);
            for branch in &branches {
                task.add_repository(&repository, branch);
            }
            if !already_known {
                summary.repositories_processed += 1;
            }
        }
        tasks
    }

    /// Group configured Gitea repositories into one task per selected
    /// credential identity.
    async fn assemble_gitea_tasks(
        &self,
        summary: &mut TriggerSummary,
    ) -> BTreeMap<String, ExecutionTask> {
        let mut tasks: BTreeMap<String, ExecutionTask> = BTreeMap::new();
        for entry in &self.config.repositories {
            if entry.platform != Platform::Gitea {
                continue;
            }
            let candidate = match self
                .statics
                .select(&self.config.gitea_host, &entry.repository)
                .await
            {
                Ok(candidate) => candidate,
                Err(err) => {
                    self.record_failure(summary, &entry.repository, &err.to_string());
                    continue;
                }
            };
            let branches = if entry.base_branches.is_empty() {
                vec![self.config.gitea_default_branch.clone()]
            } else {
                entry.base_branches.clone()
            };

            let task = tasks
                .entry(candidate.username.clone())
                .or_insert_with(|| ExecutionTask {
                    platform: Platform::Gitea,
                    username: candidate.username.clone(),
                    git_author: self.config.gitea_git_author.clone(),
                    token: candidate.secret_value.clone(),
                    api_endpoint: self.config.gitea_api_endpoint.clone(),
                    repositories: Vec::new(),
                });
            let already_known = task
                .repositories
                .iter()
                .any(|r| r.repository == entry.repository);
            for branch in &branches {
                task.add_repository(&entry.repository, branch);
            }
            if !already_known {
                summary.repositories_processed += 1;
            }
        }
        tasks
    }

    fn record_failure(&self, summary: &mut TriggerSummary, repository: &str, reason: &str) {
        warn!(repository, reason, "skipping repository this sweep");
        summary.failures.push((repository.to_string(), reason.to_string()));
    }

    /// Render one batch: token secret, config object, and the Pending
    /// execution, all keyed by the execution name.
    async fn render_execution(&self, task: &ExecutionTask) -> Result<(), StoreError> {
        let name = execution_name(task.platform);
        let namespace = &self.config.namespace;

        let host = match task.platform {
            Platform::Github => host_of(&self.config.github_api_endpoint),
            Platform::Gitea => self.config.gitea_host.clone(),
        };
        let labels = Labels::from([
            (LABEL_COMPONENT.to_string(), COMPONENT_UPDATE_RUN.to_string()),
            (LABEL_PLATFORM.to_string(), task.platform.as_str().to_string()),
            (LABEL_HOST.to_string(), host),
        ]);

        self.store
            .create_secret(Secret {
                name: name.clone(),
                namespace: namespace.clone(),
                labels: labels.clone(),
                data: BTreeMap::from([(TOKEN_DATA_KEY.to_string(), task.token.clone())]),
            })
            .await?;

        self.store
            .create_config(ConfigObject {
                name: name.clone(),
                namespace: namespace.clone(),
                labels: labels.clone(),
                data: BTreeMap::from([(TASKS_DATA_KEY.to_string(), task.payload().to_string())]),
            })
            .await?;

        let spec = PipelineBuilder::new(&name, namespace)
            .labels(&labels)
            .service_account(&self.config.service_account)
            .mount_secret(&name, "/credentials", vec![TOKEN_DATA_KEY.to_string()])
            .mount_config(&name, "/config", vec![TASKS_DATA_KEY.to_string()])
            .pending(true)
            .build();

        let mut execution = QueuedExecution::pending(&name, namespace.clone(), labels);
        execution.spec = Some(spec);
        self.store.create_execution(execution).await?;

        info!(
            execution = %name,
            platform = %task.platform,
            repositories = task.repositories.len(),
            "rendered queued execution"
        );
        Ok(())
    }

    /// Spawn the cron-driven trigger loop.
    pub fn start(self: &Arc<Self>, schedule: cron::Schedule) -> tokio::task::JoinHandle<()> {
        let trigger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("trigger schedule has no future occurrences; stopping");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                if let Err(err) = trigger.run().await {
                    warn!(error = %err, "fleet trigger sweep failed; retrying on next schedule");
                }
            }
        })
    }
}

fn execution_name(platform: Platform) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("update-{}-{}", platform.as_str(), &suffix[..8])
}

/// Host part of an API endpoint, for the host label.
fn host_of(endpoint: &str) -> String {
    let stripped = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use depfleet_common::{ExecutionStatus, LABEL_CREDENTIAL, MemoryStore, test_guard};
    use depfleet_creds::MockAppApi;

    const NS: &str = "depfleet";

    struct Fixture {
        store: Arc<MemoryStore>,
        trigger: FleetTrigger,
    }

    fn fixture(api: MockAppApi, repositories: Vec<RepositoryEntry>, batch_size: usize) -> Fixture {
        let store = MemoryStore::shared();
        let api = Arc::new(api);
        let directory = Arc::new(InstallationDirectory::new(
            api.clone() as Arc<dyn GithubAppApi>,
            Duration::from_secs(600),
        ));
        let issuer = Arc::new(TokenIssuer::new(
            api.clone() as Arc<dyn GithubAppApi>,
            directory.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        ));
        let statics = Arc::new(StaticCredentialSource::new(
            store.clone() as Arc<dyn ObjectStore>,
            NS,
            Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())]),
        ));
        let config = TriggerConfig {
            namespace: NS.to_string(),
            batch_size,
            service_account: "depfleet-runner".to_string(),
            github_api_endpoint: "https://api.github.com".to_string(),
            github_username: "depfleet[bot]".to_string(),
            github_git_author: "Depfleet Bot <bot@depfleet.dev>".to_string(),
            github_autodiscover: true,
            gitea_host: "gitea.internal".to_string(),
            gitea_api_endpoint: "https://gitea.internal/api/v1".to_string(),
            gitea_git_author: "Depfleet Bot <bot@depfleet.dev>".to_string(),
            gitea_default_branch: "main".to_string(),
            repositories,
        };
        let trigger = FleetTrigger::new(
            store.clone() as Arc<dyn ObjectStore>,
            api as Arc<dyn GithubAppApi>,
            directory,
            issuer,
            statics,
            EventBus::new(8),
            config,
        );
        Fixture { store, trigger }
    }

    async fn seed_gitea_credential(store: &MemoryStore) {
        store
            .create_secret(Secret {
                name: "gitea-cred".to_string(),
                namespace: NS.to_string(),
                labels: Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())]),
                data: BTreeMap::from([
                    ("host".to_string(), "gitea.internal".to_string()),
                    ("username".to_string(), "updater".to_string()),
                    ("password".to_string(), "s3cret".to_string()),
                ]),
            })
            .await
            .unwrap();
    }

    fn gitea_entry(repository: &str, branches: &[&str]) -> RepositoryEntry {
        RepositoryEntry {
            platform: Platform::Gitea,
            repository: repository.to_string(),
            base_branches: branches.iter().map(|b| b.to_string()).collect(),
        }
    }

    fn github_entry(repository: &str, branches: &[&str]) -> RepositoryEntry {
        RepositoryEntry {
            platform: Platform::Github,
            repository: repository.to_string(),
            base_branches: branches.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn installation_repositories_share_one_execution() {
        let _guard = test_guard!();
        let fx = fixture(
            MockAppApi::new().with_installation(7, &["acme/widgets", "acme/gadgets"]),
            Vec::new(),
            20,
        );

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 1);
        assert_eq!(summary.repositories_processed, 2);
        assert!(summary.failures.is_empty());

        let executions = fx
            .store
            .list_executions(NS, &Labels::new())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.labels[LABEL_PLATFORM], "github");
        assert_eq!(execution.labels[LABEL_HOST], "api.github.com");
        assert!(execution.spec.as_ref().unwrap().pending);

        // Secret holds the token, config holds the payload without it.
        let secret = fx.store.get_secret(NS, &execution.name).await.unwrap();
        assert!(secret.data[TOKEN_DATA_KEY].starts_with("ghs_mock_7_"));
    }

    #[tokio::test]
    async fn batching_splits_large_installations() {
        let _guard = test_guard!();
        let fx = fixture(
            MockAppApi::new().with_installation(
                7,
                &["acme/a", "acme/b", "acme/c", "acme/d", "acme/e"],
            ),
            Vec::new(),
            2,
        );

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.repositories_processed, 5);
        assert_eq!(summary.executions_created, 3);
    }

    #[tokio::test]
    async fn per_repository_failure_never_aborts_the_sweep() {
        let _guard = test_guard!();
        // One healthy installation plus an explicit repository nothing owns.
        let fx = fixture(
            MockAppApi::new().with_installation(7, &["acme/widgets"]),
            vec![github_entry("acme/unclaimed", &["main"])],
            20,
        );

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "acme/unclaimed");
    }

    #[tokio::test]
    async fn explicit_branches_merge_with_discovered_default() {
        let _guard = test_guard!();
        let fx = fixture(
            MockAppApi::new()
                .with_installation(7, &["acme/widgets"])
                .with_default_branch("acme/widgets", "main"),
            vec![github_entry("acme/widgets", &["main", "release-1.x"])],
            20,
        );

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 1);
        // The same repository reached the task twice (discovery + explicit)
        // but is counted and rendered once, with merged branches.
        assert_eq!(summary.repositories_processed, 1);

        let executions = fx.store.list_executions(NS, &Labels::new()).await.unwrap();
        let config_object = fx.store.get_config(NS, &executions[0].name).await.unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(&config_object.data[TASKS_DATA_KEY]).unwrap();
        let repositories = payload["repositories"].as_array().unwrap();
        assert_eq!(repositories.len(), 1);
        assert_eq!(repositories[0]["repository"], "acme/widgets");
        assert_eq!(
            repositories[0]["base_branches"],
            serde_json::json!(["main", "release-1.x"])
        );
        // The credential never leaks into the config payload.
        assert!(!config_object.data[TASKS_DATA_KEY].contains("ghs_mock"));
    }

    #[tokio::test]
    async fn gitea_repositories_use_selected_static_credential() {
        let _guard = test_guard!();
        let fx = fixture(
            MockAppApi::new(),
            vec![
                gitea_entry("infra/deploy-tool", &[]),
                gitea_entry("infra/dashboards", &["develop"]),
            ],
            20,
        );
        seed_gitea_credential(&fx.store).await;

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 1);
        assert_eq!(summary.repositories_processed, 2);

        let executions = fx.store.list_executions(NS, &Labels::new()).await.unwrap();
        let execution = &executions[0];
        assert_eq!(execution.labels[LABEL_PLATFORM], "gitea");
        assert_eq!(execution.labels[LABEL_HOST], "gitea.internal");

        let secret = fx.store.get_secret(NS, &execution.name).await.unwrap();
        assert_eq!(secret.data[TOKEN_DATA_KEY], "s3cret");
    }

    #[tokio::test]
    async fn gitea_without_credentials_records_failures_only() {
        let _guard = test_guard!();
        let fx = fixture(MockAppApi::new(), vec![gitea_entry("infra/tool", &[])], 20);

        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 0);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].1.contains("not found"));
    }

    #[tokio::test]
    async fn rendered_executions_flow_through_admission() {
        let _guard = test_guard!();
        use crate::admission::{AdmissionConfig, AdmissionController};

        let fx = fixture(
            MockAppApi::new().with_installation(7, &["acme/a", "acme/b", "acme/c"]),
            Vec::new(),
            1,
        );
        let summary = fx.trigger.run().await.unwrap();
        assert_eq!(summary.executions_created, 3);

        let controller = AdmissionController::new(
            fx.store.clone() as Arc<dyn ObjectStore>,
            AdmissionConfig {
                ceiling: 2,
                ..AdmissionConfig::default()
            },
            EventBus::new(8),
        );
        controller.tick().await.unwrap();

        let executions = fx.store.list_executions(NS, &Labels::new()).await.unwrap();
        let active = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Active)
            .count();
        let pending = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .count();
        assert_eq!(active, 2);
        assert_eq!(pending, 1);
    }

    #[test]
    fn host_extraction() {
        let _guard = test_guard!();
        assert_eq!(host_of("https://api.github.com"), "api.github.com");
        assert_eq!(host_of("https://gitea.internal/api/v1"), "gitea.internal");
        assert_eq!(host_of("gitea.internal"), "gitea.internal");
    }

    #[test]
    fn execution_names_are_distinct_and_labelled_by_platform() {
        let _guard = test_guard!();
        let a = execution_name(Platform::Github);
        let b = execution_name(Platform::Github);
        assert!(a.starts_with("update-github-"));
        assert_ne!(a, b);
    }
}
