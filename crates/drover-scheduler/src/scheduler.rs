// Per-project assembly of refresher, producer, and consumer.

use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drover_queue::TaskQueue;

use crate::backoff::BackoffCache;
use crate::busy::BusySet;
use crate::consumer::{Consumer, ConsumerConfig, Processor};
use crate::ledger::Ledger;
use crate::lifecycle::LifecycleGate;
use crate::notify::Notifier;
use crate::producer::{Producer, ProducerConfig};
use crate::registry::{run_refresher, RefreshConfig, Registry};

/// Knobs for one project's scheduling loops.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub refresh: RefreshConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    /// Queue names to consider; `None` takes everything the broker lists.
    pub queue_match: Option<Regex>,
}

/// One project's scheduler: a registry refreshed from the broker, a producer
/// ranking it, and a consumer dispatching the probes. The ledgers, busy set,
/// and back-off cache arrive shared because they are node-wide concerns.
pub struct ProjectScheduler {
    project: String,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<Registry>,
    backoffs: Arc<BackoffCache>,
    busy: Arc<BusySet>,
    ledger: Arc<Ledger>,
    processor: Arc<dyn Processor>,
    notifier: Arc<dyn Notifier>,
    lifecycle: LifecycleGate,
    config: SchedulerConfig,
}

impl ProjectScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        backoffs: Arc<BackoffCache>,
        busy: Arc<BusySet>,
        ledger: Arc<Ledger>,
        processor: Arc<dyn Processor>,
        notifier: Arc<dyn Notifier>,
        lifecycle: LifecycleGate,
        config: SchedulerConfig,
    ) -> ProjectScheduler {
        ProjectScheduler {
            project: project.into(),
            queue,
            registry: Arc::new(Registry::new()),
            backoffs,
            busy,
            ledger,
            processor,
            notifier,
            lifecycle,
            config,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Run the three loops until the context is cancelled. In-flight work is
    /// given its lease-bounded grace by the adapters; this call returns when
    /// all loops have wound down.
    pub async fn run(self, ctx: CancellationToken) {
        info!(project = %self.project, "scheduler starting");

        // Rendezvous channel between producer and consumer. Capacity one is
        // the smallest tokio offers; the sentinel protocol on top restores
        // the hand-off semantics an unbuffered channel would give.
        let (probe_tx, probe_rx) = mpsc::channel(1);

        let refresher = tokio::spawn(run_refresher(
            self.project.clone(),
            self.registry.clone(),
            self.queue.clone(),
            self.config.queue_match.clone(),
            self.notifier.clone(),
            self.config.refresh.clone(),
            ctx.clone(),
        ));

        let consumer = Consumer::new(
            self.project.clone(),
            self.queue.clone(),
            self.registry.clone(),
            self.backoffs.clone(),
            self.busy.clone(),
            self.ledger.clone(),
            self.processor.clone(),
            self.notifier.clone(),
            self.config.consumer.clone(),
        );
        let consumer_task = tokio::spawn(consumer.run(probe_rx, ctx.clone()));

        let producer = Producer::new(
            self.project.clone(),
            self.registry.clone(),
            self.backoffs.clone(),
            self.lifecycle.clone(),
            self.notifier.clone(),
            self.config.producer.clone(),
        );
        let producer_task = tokio::spawn(producer.run(probe_tx, ctx.clone()));

        let _ = tokio::join!(refresher, producer_task, consumer_task);
        info!(project = %self.project, "scheduler stopped");
    }
}
