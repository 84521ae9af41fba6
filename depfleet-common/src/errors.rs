//! Error kinds shared across the orchestrator.
//!
//! Two error surfaces exist: [`CredentialError`] for everything the
//! credential subsystems report, and [`StoreError`] for the cluster object
//! store. Callers dispatch on the *kind*, not the message: best-effort paths
//! skip `NotFound`, retry loops act on `is_retryable`, and everything else
//! is surfaced against the single repository it concerns.

use thiserror::Error;

/// Failure kinds reported by credential resolution and minting.
///
/// Kinds are part of the contract: credential repair and the fleet trigger
/// react differently to each.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// Installation, credential, secret, or pod is absent. Skip during
    /// best-effort repair; fatal for the affected repository during
    /// resolution.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote platform rejected the credential. Not retryable until an
    /// operator fixes configuration.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Stored credential has the wrong shape (unparsable identity, bad
    /// private key). Not retryable.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// Remote platform is throttling. Retryable with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or remote 5xx. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl CredentialError {
    /// Whether another attempt can reasonably succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable kind tag for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::MalformedCredential(_) => "malformed_credential",
            Self::RateLimited(_) => "rate_limited",
            Self::Transient(_) => "transient",
        }
    }
}

/// Failures reported by the cluster object store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Anything the caller should retry on the next control tick.
    #[error("store failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for CredentialError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}
