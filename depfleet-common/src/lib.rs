//! Shared types and utilities for the Depfleet update orchestrator.
//!
//! This crate holds everything the credential subsystems and the daemon
//! agree on: the execution data model, the error kinds, the configuration
//! surface, the cluster object-store abstraction, and the pipeline-builder
//! contract consumed by the execution engine.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod testing;
pub mod types;

pub use cluster::{
    ClusterEvent, ConfigObject, Labels, MemoryStore, ObjectStore, Pod, Secret, selector_matches,
};
pub use config::{
    CredentialConfig, GeneralConfig, GiteaConfig, GithubConfig, LimitsConfig, OrchestratorConfig,
    RepositoryEntry,
};
pub use errors::{CredentialError, StoreError};
pub use pipeline::{PipelineBuilder, PipelineSpec, VolumeMount, VolumeSource};
pub use types::{
    COMPONENT_UPDATE_RUN, ExecutionStatus, ExecutionTask, LABEL_COMPONENT, LABEL_CREDENTIAL,
    LABEL_EXECUTION, LABEL_HOST, LABEL_PLATFORM, LABEL_REPOSITORY, Platform, QueuedExecution,
    RepositoryRef, TASKS_DATA_KEY, TOKEN_DATA_KEY,
};
