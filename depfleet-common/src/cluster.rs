//! Cluster object-store abstraction.
//!
//! The orchestration platform's object store and watch delivery are external
//! collaborators; the control loops only need create/get/update/list/delete
//! on a handful of namespaced object kinds, filtered by label selector, plus
//! edge-triggered failure notifications. [`ObjectStore`] captures exactly
//! that surface, and [`MemoryStore`] provides the in-process implementation
//! used by tests and the daemon's dev mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use crate::errors::StoreError;
use crate::types::QueuedExecution;

/// Namespaced object labels, also used as label selectors.
pub type Labels = BTreeMap<String, String>;

/// Whether `labels` satisfies every key/value pair in `selector`.
///
/// An empty selector matches everything.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
}

/// A namespaced secret. Values are held as UTF-8 strings; the store is the
/// system of record, nothing here persists locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A namespaced config object holding rendered task payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// The slice of a pod the repair path needs: identity plus labels linking it
/// to its execution and credential source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
}

/// Edge-triggered notification about an object, as delivered by the
/// platform's event stream. Server-side filtering narrows the stream; the
/// repair path still classifies every notification it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Object kind the event refers to (e.g. `Pod`).
    pub kind: String,
    /// Name of the referenced object.
    pub name: String,
    pub namespace: String,
    /// Machine-readable reason (e.g. `FailedMount`).
    pub reason: String,
    /// Free-form message; only classified, never parsed elsewhere.
    pub message: String,
}

/// Create/get/update/list/delete on the namespaced objects the control loops
/// touch, plus subscription to the platform's event notifications.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;
    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError>;
    async fn update_secret(&self, secret: Secret) -> Result<(), StoreError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    async fn list_secrets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<Secret>, StoreError>;

    async fn get_config(&self, namespace: &str, name: &str) -> Result<ConfigObject, StoreError>;
    async fn create_config(&self, config: ConfigObject) -> Result<(), StoreError>;
    async fn delete_config(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError>;

    async fn create_execution(&self, execution: QueuedExecution) -> Result<(), StoreError>;
    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<QueuedExecution, StoreError>;
    async fn update_execution(&self, execution: QueuedExecution) -> Result<(), StoreError>;
    async fn list_executions(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<QueuedExecution>, StoreError>;

    /// Subscribe to the platform's event notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent>;
}

const EVENT_BUFFER: usize = 256;

type Keyed<T> = HashMap<(String, String), T>;

/// In-process [`ObjectStore`] with broadcast event delivery.
///
/// Backs the daemon's dev mode and every control-loop test; state lives only
/// for the lifetime of the process.
pub struct MemoryStore {
    secrets: RwLock<Keyed<Secret>>,
    configs: RwLock<Keyed<ConfigObject>>,
    pods: RwLock<Keyed<Pod>>,
    executions: RwLock<Keyed<QueuedExecution>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            secrets: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            pods: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Shared handle, the shape every control loop takes it in.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a pod (pods are only ever observed by the core, so
    /// the fake exposes a plain upsert).
    pub async fn put_pod(&self, pod: Pod) {
        self.pods
            .write()
            .await
            .insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) {
        self.pods
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Deliver an event notification to all subscribers.
    pub fn post_event(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    pub async fn secret_count(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn config_count(&self) -> usize {
        self.configs.read().await.len()
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        self.secrets
            .read()
            .await
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found("secret", namespace, name))
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
        let mut secrets = self.secrets.write().await;
        let k = key(&secret.namespace, &secret.name);
        if secrets.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: "secret",
                namespace: secret.namespace,
                name: secret.name,
            });
        }
        secrets.insert(k, secret);
        Ok(())
    }

    async fn update_secret(&self, secret: Secret) -> Result<(), StoreError> {
        let mut secrets = self.secrets.write().await;
        let k = key(&secret.namespace, &secret.name);
        if !secrets.contains_key(&k) {
            return Err(StoreError::not_found("secret", &secret.namespace, &secret.name));
        }
        secrets.insert(k, secret);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.secrets
            .write()
            .await
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("secret", namespace, name))
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<Secret>, StoreError> {
        let secrets = self.secrets.read().await;
        let mut out: Vec<Secret> = secrets
            .values()
            .filter(|s| s.namespace == namespace && selector_matches(selector, &s.labels))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_config(&self, namespace: &str, name: &str) -> Result<ConfigObject, StoreError> {
        self.configs
            .read()
            .await
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found("config", namespace, name))
    }

    async fn create_config(&self, config: ConfigObject) -> Result<(), StoreError> {
        let mut configs = self.configs.write().await;
        let k = key(&config.namespace, &config.name);
        if configs.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: "config",
                namespace: config.namespace,
                name: config.name,
            });
        }
        configs.insert(k, config);
        Ok(())
    }

    async fn delete_config(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.configs
            .write()
            .await
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("config", namespace, name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.pods
            .read()
            .await
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found("pod", namespace, name))
    }

    async fn create_execution(&self, execution: QueuedExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let k = key(&execution.namespace, &execution.name);
        if executions.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: "execution",
                namespace: execution.namespace,
                name: execution.name,
            });
        }
        executions.insert(k, execution);
        Ok(())
    }

    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<QueuedExecution, StoreError> {
        self.executions
            .read()
            .await
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution", namespace, name))
    }

    async fn update_execution(&self, execution: QueuedExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let k = key(&execution.namespace, &execution.name);
        if !executions.contains_key(&k) {
            return Err(StoreError::not_found(
                "execution",
                &execution.namespace,
                &execution.name,
            ));
        }
        executions.insert(k, execution);
        Ok(())
    }

    async fn list_executions(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<QueuedExecution>, StoreError> {
        let executions = self.executions.read().await;
        let mut out: Vec<QueuedExecution> = executions
            .values()
            .filter(|e| e.namespace == namespace && selector_matches(selector, &e.labels))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_matching() {
        let object = labels(&[("depfleet/component", "update-run"), ("depfleet/platform", "github")]);

        assert!(selector_matches(&Labels::new(), &object));
        assert!(selector_matches(
            &labels(&[("depfleet/component", "update-run")]),
            &object
        ));
        assert!(!selector_matches(
            &labels(&[("depfleet/component", "credential")]),
            &object
        ));
        assert!(!selector_matches(&labels(&[("missing", "x")]), &object));
    }

    #[tokio::test]
    async fn secret_crud_round_trip() {
        let store = MemoryStore::new();
        let mut secret = Secret {
            name: "update-github-1".to_string(),
            namespace: "updates".to_string(),
            labels: Labels::new(),
            data: BTreeMap::from([("token".to_string(), "ghs_x".to_string())]),
        };

        store.create_secret(secret.clone()).await.unwrap();
        assert!(matches!(
            store.create_secret(secret.clone()).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        secret.data.insert("token".to_string(), "ghs_y".to_string());
        store.update_secret(secret.clone()).await.unwrap();
        let fetched = store.get_secret("updates", "update-github-1").await.unwrap();
        assert_eq!(fetched.data["token"], "ghs_y");

        store.delete_secret("updates", "update-github-1").await.unwrap();
        assert!(
            store
                .get_secret("updates", "update-github-1")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn update_missing_secret_is_not_found() {
        let store = MemoryStore::new();
        let secret = Secret {
            name: "ghost".to_string(),
            namespace: "updates".to_string(),
            ..Secret::default()
        };
        assert!(store.update_secret(secret).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selector() {
        let store = MemoryStore::new();
        for (name, ns, platform) in [
            ("a", "updates", "github"),
            ("b", "updates", "gitea"),
            ("c", "other", "github"),
        ] {
            let mut execution = QueuedExecution::pending(
                name,
                ns,
                labels(&[("depfleet/platform", platform)]),
            );
            execution.status = ExecutionStatus::Pending;
            store.create_execution(execution).await.unwrap();
        }

        let github = store
            .list_executions("updates", &labels(&[("depfleet/platform", "github")]))
            .await
            .unwrap();
        assert_eq!(github.len(), 1);
        assert_eq!(github[0].name, "a");

        let all = store.list_executions("updates", &Labels::new()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_events();

        store.post_event(ClusterEvent {
            kind: "Pod".to_string(),
            name: "update-github-1-pod".to_string(),
            namespace: "updates".to_string(),
            reason: "FailedMount".to_string(),
            message: "volume mount failed".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.reason, "FailedMount");
        assert_eq!(event.name, "update-github-1-pod");
    }
}
