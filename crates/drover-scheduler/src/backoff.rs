// Negative TTL cache of queues that must not be polled.
//
// An entry is a signal NOT to do something until it expires. Producers
// consult it before selecting a queue, the dispatcher consults it again
// before and after calling into the adapter, since a concurrent failure may
// have installed an entry in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default lifetime of an entry when the caller does not pick one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How often the sweeper purges expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct BackoffCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl BackoffCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh an entry for `key` lasting `ttl`.
    pub fn set(&self, key: &str, ttl: Duration) {
        trace!(key, ttl_ms = ttl.as_millis() as u64, "back-off installed");
        self.entries
            .lock()
            .insert(key.to_string(), Instant::now() + ttl);
    }

    pub fn set_default(&self, key: &str) {
        self.set(key, DEFAULT_TTL);
    }

    /// Whether `key` is currently backed off. Expired entries read as
    /// absent even before the sweeper removes them.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, expires| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run the periodic sweep until cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => self.sweep(),
                }
            }
        })
    }
}
