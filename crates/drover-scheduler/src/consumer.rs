// Probe dispatch and terminal-outcome translation.
//
// The consumer is the single receiver on the probe channel. For each real
// probe it re-checks back-off, claims the queue busy, gates the candidate on
// the resource hint against the live ledger picture, and only then asks the
// adapter for work. The message handler given to the adapter parses the
// payload, teaches the registry the queue's typical footprint, drives the
// processor, and turns the processor's verdict into an acknowledgement
// decision plus a fresh back-off entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use drover_core::{Request, Resource};
use drover_queue::{Credentials, MessageHandler, QueueTask, TaskQueue};

use crate::backoff::BackoffCache;
use crate::busy::BusySet;
use crate::ledger::Ledger;
use crate::notify::Notifier;
use crate::producer::{fingerprint, ProbeRequest, QueueProbe};
use crate::registry::Registry;

/// What the processor decided about one message.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// How long this queue should be left alone afterwards.
    pub backoff: Duration,
    /// Whether the message should be positively acknowledged. With an error
    /// set, `true` means the message is hopeless and must not redeliver.
    pub ack: bool,
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub fn success() -> Self {
        ProcessOutcome {
            backoff: Duration::ZERO,
            ack: true,
            error: None,
        }
    }

    /// A failure worth retrying somewhere after `backoff`.
    pub fn retry(backoff: Duration, error: impl Into<String>) -> Self {
        ProcessOutcome {
            backoff,
            ack: false,
            error: Some(error.into()),
        }
    }

    /// A permanent failure; the message is discarded.
    pub fn discard(backoff: Duration, error: impl Into<String>) -> Self {
        ProcessOutcome {
            backoff,
            ack: true,
            error: Some(error.into()),
        }
    }
}

/// Executes one parsed request to a terminal status.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        ctx: &CancellationToken,
        request: Request,
        credentials: &Credentials,
    ) -> ProcessOutcome;
}

/// Consumer policy knobs, defaults match the error-handling table.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Back-off after a resource fit mismatch.
    pub fit_backoff: Duration,
    /// Defensive back-off after a success, giving other nodes a chance at
    /// the next message.
    pub success_backoff: Duration,
    /// Back-off for a queue whose handler panicked.
    pub panic_backoff: Duration,
    /// Back-off installed when a malformed message is discarded.
    pub poison_backoff: Duration,
    /// First back-off after a broker RPC failure; consecutive failures
    /// double it up to the cap.
    pub rpc_backoff: Duration,
    pub rpc_backoff_cap: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            fit_backoff: Duration::from_secs(60),
            success_backoff: Duration::from_secs(1),
            panic_backoff: Duration::from_secs(60),
            poison_backoff: Duration::from_secs(1),
            rpc_backoff: Duration::from_secs(60),
            rpc_backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

pub struct Consumer {
    project: String,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<Registry>,
    backoffs: Arc<BackoffCache>,
    busy: Arc<BusySet>,
    ledger: Arc<Ledger>,
    processor: Arc<dyn Processor>,
    notifier: Arc<dyn Notifier>,
    config: ConsumerConfig,
    /// Consecutive broker RPC failures per fingerprint, for the doubling
    /// policy. Reset on any successful adapter call.
    rpc_failures: Mutex<HashMap<String, u32>>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<Registry>,
        backoffs: Arc<BackoffCache>,
        busy: Arc<BusySet>,
        ledger: Arc<Ledger>,
        processor: Arc<dyn Processor>,
        notifier: Arc<dyn Notifier>,
        config: ConsumerConfig,
    ) -> Arc<Consumer> {
        Arc::new(Consumer {
            project: project.into(),
            queue,
            registry,
            backoffs,
            busy,
            ledger,
            processor,
            notifier,
            config,
            rpc_failures: Mutex::new(HashMap::new()),
        })
    }

    /// Drain the probe channel until it closes or the context is cancelled.
    /// Sentinels are consumed on the spot; real probes are dispatched on
    /// their own task so the channel stays responsive.
    pub async fn run(
        self: Arc<Self>,
        mut probes: mpsc::Receiver<ProbeRequest>,
        ctx: CancellationToken,
    ) {
        debug!(project = %self.project, "started the checking consumer");

        loop {
            let request = tokio::select! {
                _ = ctx.cancelled() => break,
                r = probes.recv() => r,
            };

            match request {
                None => break,
                // Liveness sentinel from the producer's first stage.
                Some(ProbeRequest::Ready) => continue,
                Some(ProbeRequest::Probe(probe)) => {
                    let consumer = self.clone();
                    let ctx = ctx.clone();
                    let fq_name = fingerprint(&probe.project, &probe.subscription);
                    tokio::spawn(async move {
                        let worker = tokio::spawn({
                            let consumer = consumer.clone();
                            async move { consumer.filter_work(probe, ctx).await }
                        });
                        if let Err(join_err) = worker.await {
                            // A panicking handler must never take the
                            // scheduler down with it.
                            warn!(queue = %fq_name, error = %join_err, "panic while handling queue work");
                            consumer
                                .backoffs
                                .set(&fq_name, consumer.config.panic_backoff);
                        }
                    });
                }
            }
        }

        debug!(project = %self.project, "stopped the checking consumer");
    }

    async fn filter_work(self: Arc<Self>, probe: QueueProbe, ctx: CancellationToken) {
        let fq_name = fingerprint(&probe.project, &probe.subscription);

        if self.backoffs.contains(&fq_name) {
            debug!(queue = %fq_name, "in a back-off state, dropping probe");
            return;
        }

        // At most one probe or task per queue on this node. The guard also
        // releases on unwind.
        let Some(_busy) = crate::busy::BusyGuard::claim(&self.busy, &fq_name) else {
            trace!(queue = %fq_name, "already busy, dropping probe");
            return;
        };

        self.do_work(probe, &fq_name, ctx).await;
    }

    async fn do_work(&self, probe: QueueProbe, fq_name: &str, ctx: CancellationToken) {
        // A concurrent failure may have installed a back-off since the probe
        // was accepted.
        if self.backoffs.contains(fq_name) {
            trace!(queue = %fq_name, "backed off after claim");
            return;
        }

        // Admission gate: if the queue's typical footprint is known and does
        // not fit the node right now, skip the fetch entirely.
        if let Some(hint) = self.registry.resource_hint(&probe.subscription) {
            let have = self.ledger.machine_resource();
            if !hint.fits(&have) {
                info!(
                    queue = %fq_name,
                    needed = ?hint,
                    free = ?have,
                    backoff_secs = self.config.fit_backoff.as_secs(),
                    "queue needs cannot be accommodated"
                );
                self.backoffs.set(fq_name, self.config.fit_backoff);
                return;
            }
            trace!(queue = %fq_name, "passed capacity check");
        } else {
            trace!(queue = %fq_name, "skipped capacity check");
        }

        let handler = Arc::new(DispatchHandler {
            fq_name: fq_name.to_string(),
            registry_key: probe.subscription.clone(),
            registry: self.registry.clone(),
            backoffs: self.backoffs.clone(),
            processor: self.processor.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        });

        let task = QueueTask {
            fq_project: fq_name.to_string(),
            project: probe.project.clone(),
            queue_type: self.queue.queue_type(),
            subscription: probe.subscription.clone(),
            credentials: probe.credentials.clone(),
            msg: Vec::new(),
            handler,
        };

        self.registry.begin_work(&probe.subscription);
        let result = self.queue.work(&ctx, task).await;
        self.registry.end_work(&probe.subscription);

        match result {
            Ok(outcome) => {
                self.rpc_failures.lock().remove(fq_name);
                trace!(queue = %fq_name, consumed = outcome.consumed, "work attempt finished");
            }
            Err(err) => {
                // Broker trouble never reaches the broker as an ack
                // decision; it only quiets this queue locally, for twice as
                // long on every consecutive failure.
                let strikes = {
                    let mut failures = self.rpc_failures.lock();
                    let n = failures.entry(fq_name.to_string()).or_insert(0);
                    *n += 1;
                    *n
                };
                let backoff = double_backoff(self.config.rpc_backoff, strikes)
                    .min(self.config.rpc_backoff_cap);
                self.backoffs.set(fq_name, backoff);
                warn!(
                    queue = %fq_name,
                    error = %err,
                    strikes,
                    backoff_secs = backoff.as_secs(),
                    "work attempt failed"
                );
            }
        }
    }
}

fn double_backoff(base: Duration, strikes: u32) -> Duration {
    base.saturating_mul(1u32 << (strikes.saturating_sub(1)).min(16))
}

/// The message handler wired into the adapter's `work` call.
struct DispatchHandler {
    fq_name: String,
    /// Name the registry knows the queue by; adapters may rewrite the task's
    /// own subscription to the broker-local form.
    registry_key: String,
    registry: Arc<Registry>,
    backoffs: Arc<BackoffCache>,
    processor: Arc<dyn Processor>,
    notifier: Arc<dyn Notifier>,
    config: ConsumerConfig,
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, ctx: &CancellationToken, task: &QueueTask) -> (Option<Resource>, bool) {
        // Self-destruct if a back-off landed while the message was in
        // transit; the broker redelivers it later.
        if self.backoffs.contains(&self.fq_name) {
            debug!(queue = %self.fq_name, "backing off, returning the message");
            return (None, false);
        }

        let request = match Request::parse(&task.msg) {
            Ok(r) => r,
            Err(err) => {
                // Malformed payloads are discarded; redelivering poison
                // helps nobody.
                warn!(queue = %self.fq_name, error = %err, "unparseable message dumped");
                self.backoffs.set(&self.fq_name, self.config.poison_backoff);
                return (None, true);
            }
        };

        let resource = request.experiment.resource.clone();
        if let Err(err) = self
            .registry
            .set_resource(&self.registry_key, resource.clone())
        {
            info!(queue = %self.fq_name, error = %err, "resource hint not updated");
        }

        let dest = request.config.runner.notify_destination.clone();
        let header = format!(
            "queue {} experiment {}",
            self.fq_name, request.experiment.key
        );
        info!("started {header}");
        self.notifier.info(&dest, &format!("started {header}")).await;

        let outcome = self
            .processor
            .process(ctx, request, &task.credentials)
            .await;

        if let Some(error) = &outcome.error {
            self.backoffs.set(&self.fq_name, outcome.backoff);
            if outcome.ack {
                let text = format!(
                    "{header} dumped, backing off for {}s due to {error}",
                    outcome.backoff.as_secs()
                );
                warn!("{text}");
                self.notifier.warning(&dest, &text).await;
            } else {
                let text = format!(
                    "{header} will retry, backing off for {}s due to {error}",
                    outcome.backoff.as_secs()
                );
                info!("{text}");
                self.notifier.info(&dest, &text).await;
            }
            return (None, outcome.ack);
        }

        // Success: leave a short defensive back-off so other nodes get a
        // chance at the queue's next message.
        self.backoffs
            .set(&self.fq_name, self.config.success_backoff);
        info!("stopped {header}");
        self.notifier.info(&dest, &format!("stopped {header}")).await;
        (Some(resource), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_strike_and_caps() {
        let base = Duration::from_secs(60);
        assert_eq!(double_backoff(base, 1), Duration::from_secs(60));
        assert_eq!(double_backoff(base, 2), Duration::from_secs(120));
        assert_eq!(double_backoff(base, 3), Duration::from_secs(240));

        let capped = double_backoff(base, 3).min(Duration::from_secs(900));
        assert_eq!(capped, Duration::from_secs(240));
        let capped = double_backoff(base, 6).min(Duration::from_secs(900));
        assert_eq!(capped, Duration::from_secs(900));
    }

    #[test]
    fn outcome_constructors_carry_the_policy() {
        let ok = ProcessOutcome::success();
        assert!(ok.ack && ok.error.is_none());

        let retry = ProcessOutcome::retry(Duration::from_secs(30), "i/o");
        assert!(!retry.ack);
        assert_eq!(retry.backoff, Duration::from_secs(30));

        let dump = ProcessOutcome::discard(Duration::from_secs(300), "bad spec");
        assert!(dump.ack && dump.error.is_some());
    }
}
