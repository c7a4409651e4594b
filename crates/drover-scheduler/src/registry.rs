// Subscription registry and the refresh loop that keeps it honest.
//
// Queues come and go at the broker. Each refresh tick lists what the broker
// reports, diffs it against the in-memory map under one lock, and drops
// subscriptions the broker no longer knows so the next producer tick cannot
// select them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drover_core::Resource;
use drover_queue::{Credentials, TaskQueue};

use crate::error::{Result, SchedulerError};
use crate::notify::Notifier;

#[derive(Debug, Clone)]
struct Subscription {
    /// Last resource need observed in a message from this queue. The fit
    /// gate uses it to skip queues whose typical work cannot land here.
    resource: Option<Resource>,
    /// Messages currently being worked on this node.
    in_flight: u32,
    credentials: Credentials,
}

/// A snapshot row handed to the producer for ranking.
#[derive(Debug, Clone)]
pub struct RankedSubscription {
    pub name: String,
    pub in_flight: u32,
    pub credentials: Credentials,
}

/// The catalog of queues within one project, keyed by qualified name.
#[derive(Default)]
pub struct Registry {
    subs: Mutex<HashMap<String, Subscription>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the catalog up to date with what the broker reported. Returns
    /// the names added and removed, already sorted for stable log lines.
    pub fn align(&self, expected: &HashMap<String, Credentials>) -> (Vec<String>, Vec<String>) {
        let mut subs = self.subs.lock();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for (name, creds) in expected {
            if !subs.contains_key(name) {
                subs.insert(
                    name.clone(),
                    Subscription {
                        resource: None,
                        in_flight: 0,
                        credentials: creds.clone(),
                    },
                );
                added.push(name.clone());
            }
        }

        subs.retain(|name, _| {
            if expected.contains_key(name) {
                true
            } else {
                removed.push(name.clone());
                false
            }
        });

        added.sort();
        removed.sort();
        (added, removed)
    }

    /// Record the resource need observed in the latest message so future
    /// probes of this queue can be admission checked before fetching.
    pub fn set_resource(&self, name: &str, resource: Resource) -> Result<()> {
        let mut subs = self.subs.lock();
        let sub = subs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownSubscription(name.to_string()))?;
        sub.resource = Some(resource);
        Ok(())
    }

    pub fn resource_hint(&self, name: &str) -> Option<Resource> {
        self.subs.lock().get(name).and_then(|s| s.resource.clone())
    }

    pub fn begin_work(&self, name: &str) {
        if let Some(sub) = self.subs.lock().get_mut(name) {
            sub.in_flight += 1;
        }
    }

    pub fn end_work(&self, name: &str) {
        if let Some(sub) = self.subs.lock().get_mut(name) {
            sub.in_flight = sub.in_flight.saturating_sub(1);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.subs.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }

    /// Snapshot the catalog sorted ascending by in-flight count, the
    /// quietest queues first.
    pub fn rank(&self) -> Vec<RankedSubscription> {
        let subs = self.subs.lock();
        let mut ranked: Vec<RankedSubscription> = subs
            .iter()
            .map(|(name, sub)| RankedSubscription {
                name: name.clone(),
                in_flight: sub.in_flight,
                credentials: sub.credentials.clone(),
            })
            .collect();
        ranked.sort_by_key(|s| s.in_flight);
        ranked
    }
}

/// Refresh cadence knobs.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Delay before the very first refresh, kept short so a fresh node
    /// starts seeing queues immediately.
    pub first_interval: Duration,
    pub interval: Duration,
    /// Failure cap for the doubled retry interval.
    pub max_interval: Duration,
    /// Deadline on each broker listing call.
    pub op_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            first_interval: Duration::from_secs(1),
            interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(15 * 60),
            op_timeout: Duration::from_secs(15),
        }
    }
}

/// Periodically list the broker and align the registry, until cancelled.
/// Listing failures double the next interval up to the cap; any success
/// resets it.
pub async fn run_refresher(
    project: String,
    registry: Arc<Registry>,
    queue: Arc<dyn TaskQueue>,
    matcher: Option<Regex>,
    notifier: Arc<dyn Notifier>,
    config: RefreshConfig,
    ctx: CancellationToken,
) {
    debug!(project = %project, "started registry refresher");
    let mut next = config.first_interval;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(project = %project, "stopped registry refresher");
                return;
            }
            _ = tokio::time::sleep(next) => {}
        }

        let listing = tokio::time::timeout(config.op_timeout, queue.refresh(&ctx, matcher.as_ref()))
            .await
            .unwrap_or_else(|_| {
                Err(drover_queue::QueueError::Transport(
                    drover_queue::TransportError::Unavailable("listing timed out".to_string()),
                ))
            });

        match listing {
            Ok(known) => {
                next = config.interval;
                let (added, removed) = registry.align(&known);
                if !added.is_empty() || !removed.is_empty() {
                    let mut parts = Vec::new();
                    if !added.is_empty() {
                        parts.push(format!("added queues {}", added.join(", ")));
                    }
                    if !removed.is_empty() {
                        parts.push(format!("removed queues {}", removed.join(", ")));
                    }
                    let msg = format!("project {} {}", project, parts.join(", and "));
                    info!("{msg}");
                    notifier.info("", &msg).await;
                }
            }
            Err(err) => {
                next = (next * 2).min(config.max_interval);
                warn!(project = %project, error = %err, retry_secs = next.as_secs(), "queue listing failed");
            }
        }
    }
}
