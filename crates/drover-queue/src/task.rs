// The contract between the scheduler and a queue adapter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use drover_core::Resource;

use crate::error::Result;

/// Credential material handed back by a refresh, opaque to the registry.
#[derive(Clone)]
pub enum Credentials {
    /// A service-account file on local disk.
    ServiceAccount { file: PathBuf },
    /// User and password peeled out of a broker URL.
    UserPass { user: String, password: String },
    /// A set of profile/config files, SQS style.
    ProfileFiles { files: Vec<PathBuf> },
}

// Hand-rolled so a password can never reach a log line.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ServiceAccount { file } => f
                .debug_struct("ServiceAccount")
                .field("file", file)
                .finish(),
            Credentials::UserPass { user, .. } => f
                .debug_struct("UserPass")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::ProfileFiles { files } => f
                .debug_struct("ProfileFiles")
                .field("files", files)
                .finish(),
        }
    }
}

/// Everything needed to take one message off a queue and hand it to a
/// handler.
#[derive(Clone)]
pub struct QueueTask {
    /// Runner-wide label uniquely identifying the project.
    pub fq_project: String,
    pub project: String,
    pub queue_type: &'static str,
    pub subscription: String,
    pub credentials: Credentials,
    /// Message body, filled in by the adapter once a message is received.
    pub msg: Vec<u8>,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for QueueTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTask")
            .field("fq_project", &self.fq_project)
            .field("queue_type", &self.queue_type)
            .field("subscription", &self.subscription)
            .field("msg_len", &self.msg.len())
            .finish()
    }
}

/// Handles a received message. The boolean result decides the broker-level
/// acknowledgement: `true` deletes the message, `false` returns it to the
/// queue for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, task: &QueueTask) -> (Option<Resource>, bool);
}

/// What one `work` call consumed.
#[derive(Debug, Clone, Default)]
pub struct WorkOutcome {
    /// Number of messages taken off the queue (zero or one).
    pub consumed: u64,
    /// The resource need observed in the message, when one was acknowledged.
    pub resource: Option<Resource>,
}

/// Uniform capability set over the supported brokers.
///
/// Adapters hide lease and visibility mechanics; callers only see refresh,
/// existence, and a blocking attempt at one unit of work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Scan the broker for queues whose name matches `matcher` and return
    /// them keyed by qualified name together with the credentials needed to
    /// drain them.
    async fn refresh(
        &self,
        ctx: &CancellationToken,
        matcher: Option<&Regex>,
    ) -> Result<HashMap<String, Credentials>>;

    /// Check that a subscription still exists at the broker.
    async fn exists(&self, ctx: &CancellationToken, subscription: &str) -> Result<bool>;

    /// Receive at most one message, keep its lease alive while the task's
    /// handler runs, and acknowledge according to the handler's verdict.
    async fn work(&self, ctx: &CancellationToken, task: QueueTask) -> Result<WorkOutcome>;

    /// Adapter variant tag, used in logs and metrics.
    fn queue_type(&self) -> &'static str;
}
