// Shared receive/renew/settle mechanics behind every adapter's `work`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::lease::LeaseKeeper;
use crate::task::{QueueTask, WorkOutcome};
use crate::transport::QueueTransport;

pub(crate) struct WorkParams {
    pub lease: Duration,
    pub wait: Duration,
    /// Ceiling on total in-flight time before renewal gives up.
    pub max_extension: Option<Duration>,
}

/// Receive at most one message, run the task handler under lease renewal,
/// and settle according to the handler's verdict.
pub(crate) async fn work_once(
    transport: &Arc<dyn QueueTransport>,
    ctx: &CancellationToken,
    mut task: QueueTask,
    queue: &str,
    params: WorkParams,
) -> Result<WorkOutcome> {
    let delivery = match transport.receive(queue, params.lease, params.wait).await? {
        Some(d) => d,
        None => return Ok(WorkOutcome::default()),
    };

    if ctx.is_cancelled() {
        let _ = transport.nack(queue, &delivery.receipt).await;
        return Err(QueueError::Cancelled);
    }

    let keeper = LeaseKeeper::spawn(
        transport.clone(),
        queue.to_string(),
        delivery.receipt.clone(),
        params.lease,
        params.max_extension,
    );

    task.msg = delivery.body;
    let handler = task.handler.clone();
    let (resource, ack) = handler.handle(ctx, &task).await;

    // The renewer must be gone before the verdict reaches the broker so no
    // extension races the terminal settle.
    keeper.stop().await;

    if ack {
        transport.ack(queue, &delivery.receipt).await?;
        debug!(queue = %queue, "message acknowledged");
        Ok(WorkOutcome {
            consumed: 1,
            resource,
        })
    } else {
        transport.nack(queue, &delivery.receipt).await?;
        debug!(queue = %queue, "message returned for redelivery");
        Ok(WorkOutcome {
            consumed: 1,
            resource: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::task::{Credentials, MessageHandler};
    use async_trait::async_trait;
    use drover_core::Resource;

    struct Verdict {
        ack: bool,
        delay: Duration,
    }

    #[async_trait]
    impl MessageHandler for Verdict {
        async fn handle(
            &self,
            _ctx: &CancellationToken,
            task: &QueueTask,
        ) -> (Option<Resource>, bool) {
            assert!(!task.msg.is_empty());
            tokio::time::sleep(self.delay).await;
            (Some(Resource::default()), self.ack)
        }
    }

    fn task_for(queue: &str, handler: Arc<dyn MessageHandler>) -> QueueTask {
        QueueTask {
            fq_project: format!("test:{queue}"),
            project: "test".to_string(),
            queue_type: "memory",
            subscription: queue.to_string(),
            credentials: Credentials::UserPass {
                user: "u".into(),
                password: "p".into(),
            },
            msg: Vec::new(),
            handler,
        }
    }

    fn params() -> WorkParams {
        WorkParams {
            lease: Duration::from_secs(30),
            wait: Duration::from_secs(1),
            max_extension: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ack_deletes_and_reports_the_resource() {
        let mem = Arc::new(MemoryTransport::new());
        mem.push("q1", b"{}".to_vec());
        let transport: Arc<dyn QueueTransport> = mem.clone();

        let task = task_for(
            "q1",
            Arc::new(Verdict {
                ack: true,
                delay: Duration::from_millis(5),
            }),
        );
        let out = work_once(&transport, &CancellationToken::new(), task, "q1", params())
            .await
            .unwrap();

        assert_eq!(out.consumed, 1);
        assert!(out.resource.is_some());
        assert_eq!(mem.stats("q1").acks, 1);
        assert_eq!(mem.depth("q1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_returns_the_message() {
        let mem = Arc::new(MemoryTransport::new());
        mem.push("q1", b"{}".to_vec());
        let transport: Arc<dyn QueueTransport> = mem.clone();

        let task = task_for(
            "q1",
            Arc::new(Verdict {
                ack: false,
                delay: Duration::from_millis(5),
            }),
        );
        let out = work_once(&transport, &CancellationToken::new(), task, "q1", params())
            .await
            .unwrap();

        assert_eq!(out.consumed, 1);
        assert!(out.resource.is_none());
        assert_eq!(mem.stats("q1").nacks, 1);
        assert_eq!(mem.depth("q1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_handler_is_kept_leased_until_the_verdict() {
        let mem = Arc::new(MemoryTransport::new());
        mem.push("q1", b"{}".to_vec());
        let transport: Arc<dyn QueueTransport> = mem.clone();

        // Handler outlives the 30s lease several times over.
        let task = task_for(
            "q1",
            Arc::new(Verdict {
                ack: true,
                delay: Duration::from_secs(120),
            }),
        );
        let out = work_once(&transport, &CancellationToken::new(), task, "q1", params())
            .await
            .unwrap();

        assert_eq!(out.consumed, 1);
        // Never redelivered: exactly one delivery, settled by ack.
        assert_eq!(mem.stats("q1").deliveries, 1);
        assert_eq!(mem.stats("q1").acks, 1);
        assert!(mem.stats("q1").extends >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_consumes_nothing() {
        let mem = Arc::new(MemoryTransport::new());
        mem.create_queue("q1");
        let transport: Arc<dyn QueueTransport> = mem.clone();

        let task = task_for(
            "q1",
            Arc::new(Verdict {
                ack: true,
                delay: Duration::ZERO,
            }),
        );
        let out = work_once(&transport, &CancellationToken::new(), task, "q1", params())
            .await
            .unwrap();
        assert_eq!(out.consumed, 0);
    }
}
