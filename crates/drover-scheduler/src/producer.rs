// Queue ranking and probe production.
//
// Every tick the producer snapshots the subscription catalog, keeps the
// queues with nothing in flight on this node and no back-off, shuffles the
// survivors so ties never starve, and offers exactly one candidate to the
// consumer. The offer itself is two-staged over a rendezvous channel: a
// sentinel that must be accepted immediately proves the consumer is free,
// then the real probe follows under a deadline. A refused sentinel releases
// the tick without penalizing the queue that happened to be picked.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use drover_queue::Credentials;

use crate::backoff::BackoffCache;
use crate::lifecycle::LifecycleGate;
use crate::notify::Notifier;
use crate::registry::Registry;

/// The `(project, queue)` key under which busy and back-off state is held.
pub fn fingerprint(project: &str, subscription: &str) -> String {
    format!("{project}:{subscription}")
}

/// A request for the consumer to attempt one `work` call on a queue.
#[derive(Debug, Clone)]
pub struct QueueProbe {
    pub project: String,
    pub subscription: String,
    pub credentials: Credentials,
}

/// What travels over the probe channel.
#[derive(Debug, Clone)]
pub enum ProbeRequest {
    /// Liveness sentinel: consumed and discarded, proving the consumer is
    /// ready to take a probe right now.
    Ready,
    Probe(QueueProbe),
}

/// Producer cadence and deadlines.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub tick: Duration,
    /// Deadline for the second-stage probe send.
    pub probe_deadline: Duration,
    /// Back-off installed when the second stage times out.
    pub probe_failure_backoff: Duration,
    /// How long without any accepted probe before the operator is warned.
    pub starvation_warning: Duration,
    /// Rearm interval between repeated starvation warnings.
    pub starvation_rearm: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            tick: Duration::from_secs(5),
            probe_deadline: Duration::from_secs(2),
            probe_failure_backoff: Duration::from_secs(60),
            starvation_warning: Duration::from_secs(60 * 60),
            starvation_rearm: Duration::from_secs(10 * 60),
        }
    }
}

pub struct Producer {
    project: String,
    registry: Arc<Registry>,
    backoffs: Arc<BackoffCache>,
    lifecycle: LifecycleGate,
    notifier: Arc<dyn Notifier>,
    config: ProducerConfig,
}

enum OfferError {
    /// Stage one refused: the consumer is mid-dispatch.
    ConsumerBusy,
    /// Stage two timed out.
    Timeout,
    /// The consumer is gone; the producer should exit.
    Closed,
}

impl Producer {
    pub fn new(
        project: impl Into<String>,
        registry: Arc<Registry>,
        backoffs: Arc<BackoffCache>,
        lifecycle: LifecycleGate,
        notifier: Arc<dyn Notifier>,
        config: ProducerConfig,
    ) -> Producer {
        Producer {
            project: project.into(),
            registry,
            backoffs,
            lifecycle,
            notifier,
            config,
        }
    }

    /// Tick until cancelled, offering at most one probe per tick.
    pub async fn run(self, probes: mpsc::Sender<ProbeRequest>, ctx: CancellationToken) {
        debug!(project = %self.project, "started the queue checking producer");

        let mut last_ready = Instant::now();
        let mut last_ready_abs = Instant::now();
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; swallow that so the first tick lands
        // one period after start.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(project = %self.project, "stopped the queue checking producer");
                    return;
                }
                _ = tick.tick() => {}
            }

            if !self.lifecycle.is_running() {
                trace!(project = %self.project, state = ?self.lifecycle.current(), "polling suspended");
                continue;
            }

            let ranked = self.registry.rank();
            trace!(project = %self.project, count = ranked.len(), "processing ranked subscriptions");

            // Queues with no traffic on this node and no back-off in force.
            let mut idle: Vec<_> = ranked
                .into_iter()
                .filter(|sub| {
                    sub.in_flight == 0
                        && !self
                            .backoffs
                            .contains(&fingerprint(&self.project, &sub.name))
                })
                .collect();

            if !idle.is_empty() {
                // Break ranking ties at random so equally idle queues share
                // the node's attention.
                idle.shuffle(&mut rand::thread_rng());
                let pick = &idle[0];
                let fq_name = fingerprint(&self.project, &pick.name);

                match self.offer(pick.clone(), &probes).await {
                    Ok(()) => {
                        last_ready = Instant::now();
                        last_ready_abs = Instant::now();
                    }
                    Err(OfferError::ConsumerBusy) => {
                        trace!(queue = %fq_name, "consumer busy, releasing the tick");
                    }
                    Err(OfferError::Timeout) => {
                        self.backoffs
                            .set(&fq_name, self.config.probe_failure_backoff);
                        warn!(
                            queue = %fq_name,
                            backoff_secs = self.config.probe_failure_backoff.as_secs(),
                            "probe delivery timed out, backing off"
                        );
                    }
                    Err(OfferError::Closed) => return,
                }
            }

            // A long stretch with no accepted probe usually means a resource
            // problem, not quiet queues.
            if last_ready.elapsed() > self.config.starvation_warning {
                last_ready += self.config.starvation_rearm;
                let msg = format!(
                    "no work has been requested by this node for {}s, check disk and resource availability",
                    last_ready_abs.elapsed().as_secs()
                );
                warn!("{msg}");
                self.notifier.warning("", &msg).await;
            }
        }
    }

    /// Two-stage rendezvous offer: sentinel first, probe under a deadline.
    async fn offer(
        &self,
        sub: crate::registry::RankedSubscription,
        probes: &mpsc::Sender<ProbeRequest>,
    ) -> Result<(), OfferError> {
        match probes.try_send(ProbeRequest::Ready) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(OfferError::ConsumerBusy),
            Err(TrySendError::Closed(_)) => return Err(OfferError::Closed),
        }

        let probe = ProbeRequest::Probe(QueueProbe {
            project: self.project.clone(),
            subscription: sub.name,
            credentials: sub.credentials,
        });

        match probes
            .send_timeout(probe, self.config.probe_deadline)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(OfferError::Timeout),
            Err(SendTimeoutError::Closed(_)) => Err(OfferError::Closed),
        }
    }
}
