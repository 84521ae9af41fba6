//! Depfleet - fleet-wide dependency-update orchestration daemon.
//!
//! Wires the credential subsystems to the control loops: the cron-driven
//! fleet trigger renders queued update runs, the admission controller
//! promotes them under the concurrency ceiling, and the credential-repair
//! listener heals token secrets that lost the race against their pod's
//! mount.

#![forbid(unsafe_code)]

mod admission;
mod events;
mod repair;
mod trigger;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use depfleet_common::{
    LABEL_CREDENTIAL, Labels, MemoryStore, ObjectStore, OrchestratorConfig, Secret,
};
use depfleet_creds::{
    GithubAppApi, GithubAppClient, InstallationDirectory, MockAppApi, StaticCredentialSource,
    TokenIssuer,
};

use admission::{AdmissionConfig, AdmissionController};
use events::EventBus;
use repair::CredentialRepair;
use trigger::{FleetTrigger, TriggerConfig};

/// How long one installation-discovery snapshot may be served.
const DISCOVERY_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "depfleetd")]
#[command(author, version, about = "Depfleet daemon - dependency-update fleet orchestration")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Run a single trigger sweep and exit
    #[arg(long)]
    once: bool,

    /// Run against the in-memory store with seeded fixtures
    #[arg(long)]
    dev: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = OrchestratorConfig::load(cli.config.as_deref())
        .context("loading orchestrator configuration")?;
    if let Some(namespace) = cli.namespace {
        config.general.namespace = namespace;
    }

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(config.general.log_level.clone())
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting Depfleet daemon...");

    // The object store is an external collaborator; this binary wires the
    // in-process implementation, which backs dev mode and doubles as the
    // integration seam for a real cluster adapter.
    let store = MemoryStore::shared();
    let namespace = config.general.namespace.clone();

    let api: Arc<dyn GithubAppApi> = if cli.dev {
        info!("Dev mode: using mock platform API with seeded installations");
        seed_dev_fixtures(&store, &namespace).await?;
        Arc::new(
            MockAppApi::new()
                .with_installation(101, &["acme/widgets", "acme/gadgets"])
                .with_installation(102, &["globex/site"]),
        )
    } else {
        build_platform_api(&config)?
    };

    let (validity, usage_window) = config.credentials.token_windows();
    let directory = Arc::new(InstallationDirectory::new(api.clone(), DISCOVERY_MAX_AGE));
    let issuer = Arc::new(TokenIssuer::new(
        api.clone(),
        directory.clone(),
        validity,
        usage_window,
    ));
    let statics = Arc::new(StaticCredentialSource::new(
        store.clone() as Arc<dyn ObjectStore>,
        &namespace,
        static_credential_selector(),
    ));

    let events = EventBus::new(256);
    let trigger = Arc::new(FleetTrigger::new(
        store.clone() as Arc<dyn ObjectStore>,
        api,
        directory,
        issuer.clone(),
        statics.clone(),
        events.clone(),
        TriggerConfig::from_config(&config),
    ));

    if cli.once {
        let summary = trigger.run().await?;
        info!(
            executions = summary.executions_created,
            repositories = summary.repositories_processed,
            failures = summary.failures.len(),
            "single trigger sweep complete"
        );
        return Ok(());
    }

    let admission = Arc::new(AdmissionController::new(
        store.clone() as Arc<dyn ObjectStore>,
        AdmissionConfig {
            ceiling: config.limits.concurrency_ceiling,
            namespace: namespace.clone(),
            tick_interval: config.general.admission_tick(),
        },
        events.clone(),
    ));
    let repair = Arc::new(CredentialRepair::new(
        store.clone() as Arc<dyn ObjectStore>,
        issuer,
        statics,
        events.clone(),
    ));

    let schedule = cron::Schedule::from_str(&config.general.trigger_schedule)
        .with_context(|| format!("invalid trigger schedule {:?}", config.general.trigger_schedule))?;

    let _admission_handle = admission.start();
    info!(
        ceiling = config.limits.concurrency_ceiling,
        "Admission controller started"
    );

    let _repair_handle = repair.start();
    info!("Credential repair listener started");

    let _trigger_handle = trigger.start(schedule);
    info!(
        schedule = %config.general.trigger_schedule,
        "Fleet trigger scheduled"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// Construct the production platform client from configuration, or fall
/// back to an empty mock when the app is not configured (GitHub lookups
/// then fail `NotFound` until an operator provides credentials).
fn build_platform_api(config: &OrchestratorConfig) -> Result<Arc<dyn GithubAppApi>> {
    match (&config.github.app_id, &config.github.private_key_path) {
        (app_id, Some(key_path)) if !app_id.is_empty() => {
            let pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("reading app private key {}", key_path.display()))?;
            let client = GithubAppClient::new(
                app_id.clone(),
                SecretString::from(pem),
                &config.github.api_endpoint,
            )?;
            Ok(Arc::new(client))
        }
        _ => {
            warn!("github app credentials not configured; github lookups will find nothing");
            Ok(Arc::new(MockAppApi::new()))
        }
    }
}

fn static_credential_selector() -> Labels {
    Labels::from([(LABEL_CREDENTIAL.to_string(), "static".to_string())])
}

/// Seed the in-memory store with an operator-style static credential so
/// dev-mode sweeps have something to select.
async fn seed_dev_fixtures(store: &Arc<MemoryStore>, namespace: &str) -> Result<()> {
    store
        .create_secret(Secret {
            name: "gitea-fleet-credential".to_string(),
            namespace: namespace.to_string(),
            labels: static_credential_selector(),
            data: BTreeMap::from([
                ("host".to_string(), "gitea.internal".to_string()),
                ("username".to_string(), "depfleet-dev".to_string()),
                ("password".to_string(), "dev-password".to_string()),
                ("repositories".to_string(), "infra/*".to_string()),
            ]),
        })
        .await?;
    Ok(())
}
