// SQS-style adapter variant.
//
// Credentials are a list of profile/config files that must all be present on
// local disk. Queue names are qualified with the region so one runner can
// watch several regions without collisions; `work` strips the qualifier back
// off before talking to the broker.

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

const QUEUE_TYPE: &str = "sqs";
const VISIBILITY: Duration = Duration::from_secs(30);
const WAIT: Duration = Duration::from_secs(5);

pub struct SqsQueue {
    project: String,
    region: String,
    files: Vec<PathBuf>,
    transport: Arc<dyn QueueTransport>,
}

impl SqsQueue {
    pub fn new(
        project: &str,
        files: Vec<PathBuf>,
        transport: Arc<dyn QueueTransport>,
    ) -> Result<SqsQueue> {
        for file in &files {
            std::fs::metadata(file).map_err(|source| QueueError::CredentialFile {
                path: file.clone(),
                source,
            })?;
        }
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Ok(SqsQueue {
            project: project.to_string(),
            region,
            files,
            transport,
        })
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}:{}", self.region, name)
    }

    /// Strip the region qualifier from a subscription name.
    fn unqualify(subscription: &str) -> Result<&str> {
        subscription
            .split_once(':')
            .map(|(_, name)| name)
            .ok_or_else(|| QueueError::BadSubscription(subscription.to_string()))
    }
}

#[async_trait]
impl TaskQueue for SqsQueue {
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
                    self.qualify(&name),
                    Credentials::ProfileFiles {
                        files: self.files.clone(),
                    },
                );
            }
        }
        debug!(project = %self.project, region = %self.region, count = known.len(), "refreshed queues");
        Ok(known)
    }

    async fn exists(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        let names = self.transport.list_queues().await?;
        Ok(names.iter().any(|n| subscription.ends_with(n.as_str())))
    }

    async fn work(&self, ctx: &CancellationToken, mut task: QueueTask) -> Result<WorkOutcome> {
        // The registry tracks the region-qualified name; the broker wants the
        // bare one, and so does the handler.
        let queue = Self::unqualify(&task.subscription)?.to_string();
        task.subscription = queue.clone();
        work_once(
            &self.transport,
            ctx,
            task,
            &queue,
            WorkParams {
                lease: VISIBILITY,
                wait: WAIT,
                max_extension: None,
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

    fn adapter(mem: &Arc<MemoryTransport>) -> (SqsQueue, tempfile::NamedTempFile) {
        let creds = tempfile::NamedTempFile::new().unwrap();
        let q = SqsQueue::new(
            "sandbox",
            vec![creds.path().to_path_buf()],
            mem.clone() as Arc<dyn QueueTransport>,
        )
        .unwrap();
        (q, creds)
    }

    #[tokio::test]
    async fn refresh_qualifies_names_with_the_region() {
        let mem = Arc::new(MemoryTransport::new());
        mem.create_queue("studio_train");
        let (q, _creds) = adapter(&mem);
        let known = q.refresh(&CancellationToken::new(), None).await.unwrap();
        let name = known.keys().next().unwrap();
        assert!(name.ends_with(":studio_train"));
        assert!(name.contains(':'));
    }

    #[test]
    fn unqualify_splits_once() {
        assert_eq!(
            SqsQueue::unqualify("us-east-1:https://queue/url").unwrap(),
            "https://queue/url"
        );
        assert!(SqsQueue::unqualify("bare-name").is_err());
    }

    #[test]
    fn every_credential_file_must_exist() {
        let mem: Arc<dyn QueueTransport> = Arc::new(MemoryTransport::new());
        let present = tempfile::NamedTempFile::new().unwrap();
        let r = SqsQueue::new(
            "sandbox",
            vec![
                present.path().to_path_buf(),
                PathBuf::from("/absent/credentials"),
            ],
            mem,
        );
        assert!(matches!(r, Err(QueueError::CredentialFile { .. })));
    }
}
