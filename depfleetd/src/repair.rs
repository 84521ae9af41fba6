//! Event-driven credential repair.
//!
//! An execution pod can mount its token secret before the trigger's secret
//! write has landed; the mount then fails with a "non-existent secret key"
//! event. Instead of letting the execution retry the mount until its
//! timeout, this listener heals the secret in place: it re-mints (GitHub)
//! or re-selects (Gitea) the credential and writes the missing key. When
//! the credential can never be obtained, the owning execution is cancelled
//! with the reason attached so it stops occupying a concurrency slot.
//!
//! The brittle part, matching the platform's failure-message wording,
//! lives in exactly one place: [`classify_notification`].

use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use depfleet_common::{
    ClusterEvent, CredentialError, ExecutionStatus, LABEL_EXECUTION, LABEL_HOST, LABEL_PLATFORM,
    LABEL_REPOSITORY, ObjectStore, Platform, Pod, StoreError, TOKEN_DATA_KEY,
};
use depfleet_creds::{StaticCredentialSource, TokenIssuer};

use crate::events::EventBus;

// =========================================================================
// Notification classification
// =========================================================================

/// Typed result of classifying a platform notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationClass {
    /// A pod failed to mount `volume` because the credential key did not
    /// exist yet.
    MissingCredentialKey { volume: String },
    /// Anything else; ignored.
    Irrelevant,
}

fn missing_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"MountVolume\.SetUp failed for volume "([^"]+)"\s*:.*references non-existent secret key:\s*(\S+)"#,
        )
        .expect("hard-coded pattern")
    })
}

/// Classify a notification, isolating the failure-message string match.
///
/// Only a `FailedMount` on a pod whose message names the known credential
/// key is relevant; everything else is `Irrelevant`.
pub fn classify_notification(event: &ClusterEvent) -> NotificationClass {
    if event.kind != "Pod" || event.reason != "FailedMount" {
        return NotificationClass::Irrelevant;
    }
    let Some(captures) = missing_key_pattern().captures(&event.message) else {
        return NotificationClass::Irrelevant;
    };
    if &captures[2] != TOKEN_DATA_KEY {
        return NotificationClass::Irrelevant;
    }
    NotificationClass::MissingCredentialKey {
        volume: captures[1].to_string(),
    }
}

// =========================================================================
// Repairer
// =========================================================================

/// What one notification ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The missing key was minted and written.
    Repaired,
    /// The key already existed; nothing to do.
    AlreadyPresent,
    /// Irrelevant notification, or a referenced object was already gone.
    Skipped,
    /// Minting failed; the owning execution was cancelled.
    Cancelled,
}

/// Heals token secrets that lost the race against their pod's mount.
pub struct CredentialRepair {
    store: Arc<dyn ObjectStore>,
    issuer: Arc<TokenIssuer>,
    statics: Arc<StaticCredentialSource>,
    events: EventBus,
}

impl CredentialRepair {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        issuer: Arc<TokenIssuer>,
        statics: Arc<StaticCredentialSource>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            issuer,
            statics,
            events,
        }
    }

    /// Handle one notification. Idempotent: a second identical notification
    /// finds the key present and is a no-op.
    pub async fn handle(&self, event: &ClusterEvent) -> Result<RepairOutcome, StoreError> {
        let volume = match classify_notification(event) {
            NotificationClass::MissingCredentialKey { volume } => volume,
            NotificationClass::Irrelevant => return Ok(RepairOutcome::Skipped),
        };

        // Pod, then secret; either may legitimately be gone already.
        let pod = match self.store.get_pod(&event.namespace, &event.name).await {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => {
                debug!(pod = %event.name, "pod gone before repair; skipping");
                return Ok(RepairOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };
        let mut secret = match self.store.get_secret(&event.namespace, &volume).await {
            Ok(secret) => secret,
            Err(err) if err.is_not_found() => {
                debug!(secret = %volume, "secret gone before repair; skipping");
                return Ok(RepairOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };

        if secret.data.contains_key(TOKEN_DATA_KEY) {
            debug!(secret = %secret.name, "credential key already present; repair is a no-op");
            return Ok(RepairOutcome::AlreadyPresent);
        }

        match self.resolve_credential(&pod).await {
            Ok(token) => {
                secret.data.insert(TOKEN_DATA_KEY.to_string(), token);
                self.store.update_secret(secret.clone()).await?;
                info!(
                    secret = %secret.name,
                    pod = %pod.name,
                    "repaired missing credential key"
                );
                self.events.emit(
                    "credential_repaired",
                    &json!({ "secret": secret.name, "pod": pod.name }),
                );
                Ok(RepairOutcome::Repaired)
            }
            Err(err) => {
                error!(
                    pod = %pod.name,
                    kind = err.kind(),
                    error = %err,
                    "credential cannot be obtained; cancelling owning execution"
                );
                self.cancel_owning_execution(&pod, &err).await?;
                Ok(RepairOutcome::Cancelled)
            }
        }
    }

    /// Re-mint (GitHub) or re-select (Gitea) the pod's credential, driven
    /// by the labels the trigger stamped onto the pod.
    async fn resolve_credential(&self, pod: &Pod) -> Result<String, CredentialError> {
        let platform = pod
            .labels
            .get(LABEL_PLATFORM)
            .and_then(|value| Platform::from_label(value))
            .ok_or_else(|| {
                CredentialError::MalformedCredential(format!(
                    "pod {} carries no usable platform label",
                    pod.name
                ))
            })?;
        let repository = pod.labels.get(LABEL_REPOSITORY).ok_or_else(|| {
            CredentialError::MalformedCredential(format!(
                "pod {} carries no repository label",
                pod.name
            ))
        })?;

        match platform {
            Platform::Github => {
                let epoch = format!("repair/{}", pod.name);
                let record = self.issuer.token(&epoch, repository).await?;
                Ok(record.token)
            }
            Platform::Gitea => {
                let host = pod.labels.get(LABEL_HOST).ok_or_else(|| {
                    CredentialError::MalformedCredential(format!(
                        "pod {} carries no host label",
                        pod.name
                    ))
                })?;
                let candidate = self.statics.select(host, repository).await?;
                Ok(candidate.secret_value)
            }
        }
    }

    /// Cancel the execution the pod belongs to, attaching the failure
    /// reason, so it stops occupying a concurrency slot. Best-effort: a
    /// missing link label or an already-deleted execution is only logged.
    async fn cancel_owning_execution(
        &self,
        pod: &Pod,
        reason: &CredentialError,
    ) -> Result<(), StoreError> {
        let Some(name) = pod.labels.get(LABEL_EXECUTION) else {
            warn!(pod = %pod.name, "pod carries no execution label; nothing to cancel");
            return Ok(());
        };
        let mut execution = match self.store.get_execution(&pod.namespace, name).await {
            Ok(execution) => execution,
            Err(err) if err.is_not_found() => {
                debug!(execution = %name, "execution gone before cancellation; skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if !execution.transition(ExecutionStatus::Cancelled) {
            debug!(
                execution = %execution.name,
                status = %execution.status,
                "execution already terminal; not cancelling"
            );
            return Ok(());
        }
        execution.failure_reason = Some(reason.to_string());
        self.store.update_execution(execution.clone()).await?;
        self.events.emit(
            "execution_cancelled",
            &json!({ "execution": execution.name, "reason": reason.to_string() }),
        );
        Ok(())
    }

    /// Spawn the notification listener.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let repair = Arc::clone(self);
        let mut notifications = repair.store.subscribe_events();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(event) => match repair.handle(&event).await {
                        Ok(outcome) => debug!(?outcome, pod = %event.name, "repair handled notification"),
                        Err(err) => warn!(error = %err, "repair failed; awaiting next notification"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "repair listener lagged behind notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

// =========================================================================
// Tests
// =========================================================================
