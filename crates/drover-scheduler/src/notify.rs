// Outbound notification seam.
//
// The scheduler reports queue churn, task starts and stops, and starvation
// advisories to an operator channel. Delivery is someone else's problem: the
// webhook implementation lives with the runner, tests use the no-op.

use async_trait::async_trait;

/// Sends operator-facing notifications. Implementations must never let a
/// delivery failure affect scheduling; log and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Routine progress, `dest` is a destination hint from the task config
    /// and may be empty for the default channel.
    async fn info(&self, dest: &str, text: &str);

    /// Something an operator should look at.
    async fn warning(&self, dest: &str, text: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn info(&self, _dest: &str, _text: &str) {}
    async fn warning(&self, _dest: &str, _text: &str) {}
}
