mod signal;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trogon_scheduler::config::{self, Backend, RunArgs, SystemEnv};
use trogon_scheduler::nats::{self, NatsLeasePrimitive, NatsPublishHandler, NatsStore};
use trogon_scheduler::{
    EventBus, HandlerRegistry, JobDefinition, LeasePrimitive, MemoryLeasePrimitive, MemoryStore,
    ScheduleStore, Scheduler, SchedulerClient, SchedulerConfig, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "scheduler", version, about = "Distributed cron and interval job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scheduler worker until Ctrl+C or SIGTERM.
    Run(RunArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Command::Run(args) = Cli::parse().command;
    let config = config::from_args(args, &SystemEnv);

    if let Err(e) = run(config).await {
        error!("Scheduler exited with error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    let events = EventBus::new();
    let mut handlers = HandlerRegistry::with_builtins();

    match config.backend {
        Backend::Memory => {
            info!("Using in-memory backend; state is lost on exit");
            let (store, leases) = (MemoryStore::new(), MemoryLeasePrimitive::new());
            run_with(&config, store, leases, handlers, events).await
        }
        Backend::Nats => {
            let client = nats::connect(&config.nats_url).await?;
            let js = async_nats::jetstream::new(client.clone());
            let store = NatsStore::open(&js).await.context("opening job buckets")?;
            let leases = NatsLeasePrimitive::open(&js)
                .await
                .context("opening lease bucket")?;
            handlers.register(NatsPublishHandler::ID, NatsPublishHandler::new(client.clone()));

            let stop_forwarding = CancellationToken::new();
            let forwarder = nats::forward_events(&events, client, stop_forwarding.clone());
            let result = run_with(&config, store, leases, handlers, events).await;
            stop_forwarding.cancel();
            if let Err(e) = forwarder.await {
                error!(error = %e, "Event forwarder task failed");
            }
            result
        }
    }
}

async fn run_with<S, L>(
    config: &SchedulerConfig,
    store: S,
    leases: L,
    handlers: HandlerRegistry,
    events: EventBus,
) -> anyhow::Result<()>
where
    S: ScheduleStore,
    L: LeasePrimitive,
{
    let handlers = Arc::new(handlers);
    info!(handlers = ?handlers.ids(), "Registered job handlers");

    if let Some(path) = &config.jobs_file {
        let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);
        preload(&client, path).await?;
    }

    let scheduler = Scheduler::new(config, store, leases, handlers, events, SystemClock);
    scheduler.probe().await.context("backend did not answer")?;

    let token = scheduler.shutdown_token();
    tokio::spawn(async move {
        signal::shutdown_signal().await;
        token.cancel();
    });

    scheduler.run().await?;
    Ok(())
}

async fn preload<S: ScheduleStore>(
    client: &SchedulerClient<S, SystemClock>,
    path: &Path,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let definitions: Vec<JobDefinition> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    for definition in &definitions {
        client
            .upsert_job(definition)
            .await
            .with_context(|| format!("loading job '{}'", definition.id))?;
    }
    info!(count = definitions.len(), path = %path.display(), "Loaded job definitions");
    Ok(())
}
