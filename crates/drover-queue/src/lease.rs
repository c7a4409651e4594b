// Cooperative lease renewal for in-flight messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::QueueTransport;

/// Keeps one received message invisible while its handler runs.
///
/// Spawned alongside the handler by the adapter's `work` call and strictly
/// bounded by it: the adapter stops the keeper before publishing the terminal
/// acknowledgement so no renewal can race the settle. A failed renewal is
/// logged and skipped; the message simply becomes redeliverable, which
/// at-least-once delivery already tolerates.
pub struct LeaseKeeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Start renewing `receipt` every half `window`, restarting the full
    /// window on each beat. `ceiling`, when set, bounds the total time a
    /// message may be held before renewal gives up and lets it lapse.
    pub fn spawn(
        transport: Arc<dyn QueueTransport>,
        queue: String,
        receipt: String,
        window: Duration,
        ceiling: Option<Duration>,
    ) -> LeaseKeeper {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let beat = window / 2;
            let started = Instant::now();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(beat) => {}
                }

                if let Some(ceiling) = ceiling {
                    if started.elapsed() + window > ceiling {
                        warn!(
                            queue = %queue,
                            ceiling_secs = ceiling.as_secs(),
                            "lease extension ceiling reached, letting the message lapse"
                        );
                        return;
                    }
                }

                match transport.extend(&queue, &receipt, window).await {
                    Ok(()) => debug!(queue = %queue, "lease extended"),
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "lease extension failed");
                    }
                }
            }
        });

        LeaseKeeper { cancel, handle }
    }

    /// Stop renewing and wait for the renewer to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for LeaseKeeper {
    /// A keeper dropped without `stop` (a panicking handler unwinding
    /// through the adapter) must not leave the renewer running forever; the
    /// message is simply allowed to lapse back to the broker.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
