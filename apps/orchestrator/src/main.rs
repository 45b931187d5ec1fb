use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use probe_agent::HttpAgentClient;
use tokio_util::sync::CancellationToken;
use tracing::info;

use uppe_orchestrator::config::Config;
use uppe_orchestrator::database::{Repository, initialize_database};
use uppe_orchestrator::metrics::Metrics;
use uppe_orchestrator::notify::{LogSink, NotificationSink, WebhookSink};
use uppe_orchestrator::pool::open_local;
use uppe_orchestrator::registry::{CachedRegistry, DatacenterRegistry, StaticRegistry};
use uppe_orchestrator::worker::{Worker, WorkerDeps, WorkerSettings};

/// Uppe probe orchestration worker.
#[derive(Parser)]
#[command(name = "uppe-worker", version, about = "Uppe probe orchestration worker")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_deref())?;
    if cli.print_config {
        println!("{config}");
        return Ok(());
    }

    logger::init_with_level(&config.logging.level);
    info!("\n{config}");

    let pool = open_local(&config.database.path, config.database.pool_size).await?;
    {
        info!("Initializing database schema...");
        let conn = pool.get().await?;
        initialize_database(&conn).await?;
    }
    let repository = Arc::new(Repository::new_from_pool(pool));

    let registry: Arc<dyn DatacenterRegistry> = if config.registry.datacenters.is_empty() {
        repository.clone()
    } else {
        info!("Using {} static datacenter targets", config.registry.datacenters.len());
        Arc::new(StaticRegistry::new(config.registry.datacenters.clone()))
    };
    let registry = Arc::new(CachedRegistry::new(registry, Duration::from_secs(config.registry.cache_ttl_secs)));

    let agent = Arc::new(HttpAgentClient::new(Duration::from_secs(config.agent.request_timeout_secs))?);

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = &config.notifications.webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url, Duration::from_secs(config.notifications.timeout_secs))?));
    }

    let deps = WorkerDeps {
        registry,
        pipelines: repository.clone(),
        stats: repository,
        agent,
        sinks,
    };
    let worker = Worker::build(deps, WorkerSettings::from_config(&config), Metrics::global());

    let cancel = CancellationToken::new();
    let running = tokio::spawn(worker.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();
    running.await?;

    Ok(())
}
