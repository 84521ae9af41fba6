//! Admission control for queued update runs.
//!
//! Bounds how many executions run concurrently in the cluster. Each control
//! tick promotes Pending executions to Active, earliest creation time first
//! (ties broken by name), re-listing and re-counting before every promotion
//! so the loop self-limits even within one tick. The ceiling is a
//! configured constant; hitting it only delays work.
//!
//! Completion is observed, never driven: a terminal execution gets one log
//! line with its outcome and completion latency (and its rendered secret
//! and config object are garbage-collected), but no corrective action.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use depfleet_common::{
    COMPONENT_UPDATE_RUN, ExecutionStatus, LABEL_COMPONENT, Labels, ObjectStore, QueuedExecution,
    StoreError,
};

use crate::events::EventBus;

// =========================================================================
// Configuration
// =========================================================================

/// Policy knobs for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently Active executions.
    pub ceiling: u32,
    /// Namespace the controller watches.
    pub namespace: String,
    /// Interval between control ticks.
    pub tick_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ceiling: 25,
            namespace: "depfleet".to_string(),
            tick_interval: Duration::from_secs(15),
        }
    }
}

// =========================================================================
// Controller
// =========================================================================

/// Promotes queued executions under the global concurrency ceiling.
pub struct AdmissionController {
    store: Arc<dyn ObjectStore>,
    config: AdmissionConfig,
    events: EventBus,
    /// Terminal executions already logged, so each outcome is reported once.
    observed_terminal: RwLock<HashSet<String>>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn ObjectStore>, config: AdmissionConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            observed_terminal: RwLock::new(HashSet::new()),
        }
    }

    fn selector() -> Labels {
        Labels::from([(LABEL_COMPONENT.to_string(), COMPONENT_UPDATE_RUN.to_string())])
    }

    /// Run one control tick; returns how many executions were promoted.
    ///
    /// Every store failure is left to the next tick.
    pub async fn tick(&self) -> Result<u32, StoreError> {
        self.observe_completions().await?;

        let mut promoted = 0;
        loop {
            // Re-list and re-count before each promotion so the loop
            // self-limits even when other actors change the queue mid-tick.
            let executions = self
                .store
                .list_executions(&self.config.namespace, &Self::selector())
                .await?;
            let active = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Active)
                .count() as u32;
            if active >= self.config.ceiling {
                break;
            }

            let Some(next) = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Pending)
                .min_by(|a, b| {
                    a.creation_time
                        .cmp(&b.creation_time)
                        .then_with(|| a.name.cmp(&b.name))
                })
            else {
                break;
            };

            let mut execution = next.clone();
            if !execution.transition(ExecutionStatus::Active) {
                warn!(execution = %execution.name, status = %execution.status, "skipping illegal promotion");
                break;
            }
            if let Some(spec) = execution.spec.as_mut() {
                spec.pending = false;
            }
            self.store.update_execution(execution.clone()).await?;
            promoted += 1;

            info!(
                execution = %execution.name,
                active = active + 1,
                ceiling = self.config.ceiling,
                "admission: execution promoted to active"
            );
            self.events.emit(
                "execution_admitted",
                &json!({ "execution": execution.name, "namespace": execution.namespace }),
            );
        }
        Ok(promoted)
    }

    /// Log each newly-terminal execution once, with completion latency, and
    /// garbage-collect its rendered secret and config object.
    async fn observe_completions(&self) -> Result<(), StoreError> {
        let executions = self
            .store
            .list_executions(&self.config.namespace, &Self::selector())
            .await?;

        let mut observed = self.observed_terminal.write().await;
        // Forget names that no longer exist so the set stays bounded.
        let live: HashSet<&str> = executions.iter().map(|e| e.name.as_str()).collect();
        observed.retain(|name| live.contains(name.as_str()));

        for execution in executions.iter().filter(|e| e.status.is_terminal()) {
            if !observed.insert(execution.name.clone()) {
                continue;
            }
            let completed_at = execution.completed_at.unwrap_or_else(Utc::now);
            let latency = (completed_at - execution.creation_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            info!(
                execution = %execution.name,
                status = %execution.status,
                latency_secs = latency.as_secs(),
                reason = execution.failure_reason.as_deref().unwrap_or(""),
                "admission: execution completed"
            );
            self.events.emit(
                "execution_completed",
                &json!({
                    "execution": execution.name,
                    "status": execution.status,
                    "latency_secs": latency.as_secs(),
                }),
            );
            self.collect_rendered_objects(execution).await;
        }
        Ok(())
    }

    /// Best-effort deletion of the execution's rendered secret and config
    /// object; both are keyed by the execution name.
    async fn collect_rendered_objects(&self, execution: &QueuedExecution) {
        for result in [
            self.store
                .delete_secret(&execution.namespace, &execution.name)
                .await,
            self.store
                .delete_config(&execution.namespace, &execution.name)
                .await,
        ] {
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(
                    execution = %execution.name,
                    error = %err,
                    "failed to garbage-collect rendered object"
                ),
            }
        }
    }

    /// Spawn the periodic control loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(controller.config.tick_interval);
            loop {
                interval.tick().await;
                if let Err(err) = controller.tick().await {
                    warn!(error = %err, "admission tick failed; retrying next tick");
                }
            }
        })
    }
}

// =========================================================================
// Tests
// =========================================================================
