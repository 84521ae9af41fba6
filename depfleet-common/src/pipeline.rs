//! Builder contract for the pipeline-execution engine.
//!
//! The engine itself is an external collaborator; this module only renders
//! the execution definition it consumes: a named, labelled spec with a
//! service account, mounted config/secret volumes, and a pending flag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a mounted volume's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    /// Mount keys from a named secret.
    Secret(String),
    /// Mount keys from a named config object.
    Config(String),
}

/// One volume mounted into the execution's pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
    /// Keys selected from the source; empty selects all keys.
    #[serde(default)]
    pub keys: Vec<String>,
    pub read_only: bool,
}

/// Renderable execution definition handed to the pipeline engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub service_account: String,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Created in a queued state when `true`; the admission controller
    /// clears the flag when it promotes the execution.
    pub pending: bool,
}

impl PipelineSpec {
    /// Render the definition as the JSON document the engine ingests.
    pub fn render(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

/// Fluent builder for a [`PipelineSpec`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    spec: PipelineSpec,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            spec: PipelineSpec {
                name: name.into(),
                namespace: namespace.into(),
                labels: BTreeMap::new(),
                service_account: "default".to_string(),
                volumes: Vec::new(),
                pending: true,
            },
        }
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.spec
            .labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    #[must_use]
    pub fn service_account(mut self, account: impl Into<String>) -> Self {
        self.spec.service_account = account.into();
        self
    }

    /// Mount selected keys of a secret read-only.
    #[must_use]
    pub fn mount_secret(
        mut self,
        secret_name: impl Into<String>,
        mount_path: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        let secret_name = secret_name.into();
        self.spec.volumes.push(VolumeMount {
            name: secret_name.clone(),
            mount_path: mount_path.into(),
            source: VolumeSource::Secret(secret_name),
            keys,
            read_only: true,
        });
        self
    }

    /// Mount selected keys of a config object read-only.
    #[must_use]
    pub fn mount_config(
        mut self,
        config_name: impl Into<String>,
        mount_path: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        let config_name = config_name.into();
        self.spec.volumes.push(VolumeMount {
            name: config_name.clone(),
            mount_path: mount_path.into(),
            source: VolumeSource::Config(config_name),
            keys,
            read_only: true,
        });
        self
    }

    #[must_use]
    pub fn pending(mut self, pending: bool) -> Self {
        self.spec.pending = pending;
        self
    }

    pub fn build(self) -> PipelineSpec {
        self.spec
    }
}
