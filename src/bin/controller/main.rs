// System
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Third Party
use anyhow::Context;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Local
use kube_mirror_rs::{
    config::Config,
    identity::resolve_cluster_identity,
    orchestrator::Orchestrator,
    store::MongoStore,
    utils::{init_tracing, setup_exit_hooks},
};

/// Mirrors cluster security-posture resources into MongoDB.
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "./config.local.json")]
    config: PathBuf,

    /// Overrides `log_level` from the configuration file
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// How long each task gets to stop on shutdown
    #[arg(long, default_value = "10")]
    shutdown_timeout_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let _log_guard = init_tracing(
        args.log_level.as_deref().unwrap_or(&config.log_level),
        args.log_json,
        config.log_directory(),
    )
    .context("Failed to set up log files")?;

    let cancel = CancellationToken::new();
    setup_exit_hooks(cancel.clone()).context("Failed to install signal handlers")?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = MongoStore::connect(&config.mongo_uri, &config.mongo_db)
        .await
        .context("Failed to connect to MongoDB")?;
    let cluster: Arc<str> = resolve_cluster_identity(&client, config.cluster.as_deref())
        .await
        .into();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster = %cluster,
        resources = config.resources.len(),
        falco = config.falco.enabled,
        "Starting controller"
    );
    Orchestrator::with_client(&client, Arc::new(config), Arc::new(store), cluster)
        .run(cancel, Duration::from_secs(args.shutdown_timeout_seconds))
        .await;
    info!("Controller stopped");
    Ok(())
}
