// The drover node binary.
//
// Wires the process-wide singletons (ledgers, busy set, back-off cache),
// builds a queue adapter per configured broker source, and runs one
// scheduler per source until an interrupt or an internal fatal error asks
// everything to wind down.

mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drover_queue::{new_task_queue, MemoryTransport, QueueTransport, TaskQueue};
use drover_runner::{LocalStore, TaskHost, TaskHostConfig, WebhookNotifier};
use drover_scheduler::{
    run_state_file_poller, BackoffCache, BusySet, Ledger, LifecycleGate, Notifier,
    ProjectScheduler, SchedulerConfig,
};

use config::{check_account_file, Cli};

type TransportFactory = fn() -> Arc<dyn QueueTransport>;

/// Broker transports linked into this build, keyed by URL scheme. Deployment
/// builds extend this with their broker SDK transports; the in-process
/// broker is always available for local runs.
fn linked_transports() -> HashMap<&'static str, TransportFactory> {
    let mut transports: HashMap<&'static str, TransportFactory> = HashMap::new();
    transports.insert("memory", || Arc::new(MemoryTransport::new()));
    transports
}

fn connect_transport(source: &str) -> Result<Arc<dyn QueueTransport>> {
    let scheme = source.split_once("://").map(|(s, _)| s).unwrap_or("");
    match linked_transports().get(scheme) {
        Some(factory) => Ok(factory()),
        None => bail!(
            "no broker transport is linked for scheme {scheme:?} (source {source:?}); \
             this build supports: memory"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let matcher = Regex::new(&cli.queue_match)
        .with_context(|| format!("invalid --queue-match {:?}", cli.queue_match))?;
    if let Some(file) = &cli.firebase_account_file {
        check_account_file(file)?;
    }

    std::fs::create_dir_all(&cli.root_dir)
        .with_context(|| format!("cannot create {}", cli.root_dir.display()))?;
    let root = cli
        .root_dir
        .to_str()
        .context("--root-dir is not valid utf-8")?
        .to_string();

    // Process-wide singletons, never reinitialized after this point.
    let ledger = Arc::new(Ledger::new(cli.gpu_inventory()?));
    let soft_min_free = ledger.disk.set_limits(&root, cli.min_free()?)?;
    info!(root = %root, %soft_min_free, "disk ledger initialized");

    let backoffs = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let ctx = CancellationToken::new();
    let (lifecycle_tx, lifecycle) = LifecycleGate::channel();

    backoffs.clone().spawn_sweeper(ctx.clone());
    if let Some(state_file) = cli.state_file.clone() {
        tokio::spawn(run_state_file_poller(
            state_file,
            lifecycle_tx.clone(),
            Duration::from_secs(5),
            ctx.clone(),
        ));
    }

    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(cli.notify_url.clone()));
    let artifact_root = cli
        .artifact_root
        .clone()
        .unwrap_or_else(|| cli.root_dir.join("artifacts"));
    let store = Arc::new(LocalStore::new(artifact_root));
    let processor = Arc::new(TaskHost::new(
        TaskHostConfig::new(&cli.root_dir),
        ledger.clone(),
        store,
        ctx.clone(),
    ));

    // One scheduler per configured broker source.
    let mut sources: Vec<(String, String)> = Vec::new();
    if let (Some(project), Some(credentials)) = (&cli.project, &cli.credentials) {
        sources.push((project.clone(), credentials.clone()));
    }
    if !cli.amqp_url.is_empty() {
        sources.push((cli.amqp_url.clone(), String::new()));
    }
    if sources.is_empty() {
        bail!("no queue sources configured; set --project with --credentials, or --amqp-url");
    }

    let mut schedulers = Vec::new();
    for (project, credentials) in sources {
        let transport = connect_transport(&project)?;
        let queue: Arc<dyn TaskQueue> =
            Arc::from(new_task_queue(&project, &credentials, transport)?);

        let mut scheduler_config = SchedulerConfig {
            queue_match: Some(matcher.clone()),
            ..SchedulerConfig::default()
        };
        scheduler_config.refresh.op_timeout = match queue.queue_type() {
            "pubsub" => Duration::from_secs(cli.pubsub_timeout_secs),
            _ => Duration::from_secs(cli.sqs_timeout_secs),
        };

        info!(project = %project, queue_type = queue.queue_type(), "queue source configured");
        let scheduler = ProjectScheduler::new(
            project,
            queue,
            backoffs.clone(),
            busy.clone(),
            ledger.clone(),
            processor.clone(),
            notifier.clone(),
            lifecycle.clone(),
            scheduler_config,
        );
        schedulers.push(tokio::spawn(scheduler.run(ctx.clone())));
    }

    info!("drover started");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, draining"),
        _ = ctx.cancelled() => warn!("internal shutdown requested, draining"),
    }
    ctx.cancel();

    for scheduler in schedulers {
        let _ = scheduler.await;
    }
    drop(lifecycle_tx);
    info!("drover stopped");
    Ok(())
}
