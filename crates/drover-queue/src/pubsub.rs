// Cloud pub/sub adapter variant.
//
// Credentials are a service-account JSON file. Subscriptions are enumerated
// by name within the project, and received messages are held with streaming
// renewal up to a 12 hour ceiling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::task::{Credentials, QueueTask, TaskQueue, WorkOutcome};
use crate::transport::QueueTransport;
use crate::work::{work_once, WorkParams};

const QUEUE_TYPE: &str = "pubsub";
const LEASE: Duration = Duration::from_secs(30);
const WAIT: Duration = Duration::from_secs(5);

/// Streaming receives will not hold a single message longer than this.
const MAX_EXTENSION: Duration = Duration::from_secs(12 * 60 * 60);

pub struct PubSubQueue {
    project: String,
    creds: PathBuf,
    transport: Arc<dyn QueueTransport>,
}

impl PubSubQueue {
    pub fn new(
        project: &str,
        creds: PathBuf,
        transport: Arc<dyn QueueTransport>,
    ) -> Result<PubSubQueue> {
        std::fs::metadata(&creds).map_err(|source| QueueError::CredentialFile {
            path: creds.clone(),
            source,
        })?;
        Ok(PubSubQueue {
            project: project.to_string(),
            creds,
            transport,
        })
    }
}

#[async_trait]
impl TaskQueue for PubSubQueue {
    async fn refresh(
        &self,
        _ctx: &CancellationToken,
        matcher: Option<&Regex>,
    ) -> Result<HashMap<String, Credentials>> {
        let names = self.transport.list_queues().await?;
        let mut known = HashMap::with_capacity(names.len());
        for name in names {
            if matcher.map(|m| m.is_match(&name)).unwrap_or(true) {
                known.insert(
                    name,
                    Credentials::ServiceAccount {
                        file: self.creds.clone(),
                    },
                );
            }
        }
        debug!(project = %self.project, count = known.len(), "refreshed subscriptions");
        Ok(known)
    }

    async fn exists(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        let names = self.transport.list_queues().await?;
        Ok(names.iter().any(|n| n == subscription))
    }

    async fn work(&self, ctx: &CancellationToken, task: QueueTask) -> Result<WorkOutcome> {
        let queue = task.subscription.clone();
        work_once(
            &self.transport,
            ctx,
            task,
            &queue,
            WorkParams {
                lease: LEASE,
                wait: WAIT,
                max_extension: Some(MAX_EXTENSION),
            },
        )
        .await
    }

    fn queue_type(&self) -> &'static str {
        QUEUE_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    fn adapter(mem: &Arc<MemoryTransport>) -> (PubSubQueue, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        let q = PubSubQueue::new(
            "sandbox",
            file.path().to_path_buf(),
            mem.clone() as Arc<dyn QueueTransport>,
        )
        .unwrap();
        (q, file)
    }

    #[tokio::test]
    async fn refresh_filters_by_pattern() {
        let mem = Arc::new(MemoryTransport::new());
        mem.create_queue("studio_train");
        mem.create_queue("studio_eval");
        mem.create_queue("other");

        let (q, _creds) = adapter(&mem);
        let matcher = Regex::new("^studio_").unwrap();
        let known = q
            .refresh(&CancellationToken::new(), Some(&matcher))
            .await
            .unwrap();

        assert_eq!(known.len(), 2);
        assert!(known.contains_key("studio_train"));
        assert!(matches!(
            known["studio_train"],
            Credentials::ServiceAccount { .. }
        ));
    }

    #[tokio::test]
    async fn exists_checks_the_listing() {
        let mem = Arc::new(MemoryTransport::new());
        mem.create_queue("studio_train");
        let (q, _creds) = adapter(&mem);
        let ctx = CancellationToken::new();
        assert!(q.exists(&ctx, "studio_train").await.unwrap());
        assert!(!q.exists(&ctx, "gone").await.unwrap());
    }

    #[test]
    fn missing_credentials_file_is_refused() {
        let mem: Arc<dyn QueueTransport> = Arc::new(MemoryTransport::new());
        let r = PubSubQueue::new("sandbox", PathBuf::from("/no/such.json"), mem);
        assert!(matches!(r, Err(QueueError::CredentialFile { .. })));
    }
}
