// Shared fixtures for the scheduler scenario tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use drover_core::{ByteQuantity, Request};
use drover_queue::{amqp::AmqpQueue, Credentials, MemoryTransport, QueueTransport};
use drover_scheduler::{
    BackoffCache, BusySet, GpuBoard, Ledger, LifecycleGate, NodeState, ProcessOutcome,
    Processor, ProjectScheduler, Registry, SchedulerConfig,
};

pub const PROJECT: &str = "amqp://broker.local/studio";

/// A processor that replays a scripted list of outcomes, then succeeds.
pub struct ScriptedProcessor {
    script: Mutex<VecDeque<ProcessOutcome>>,
    /// Extra latency per message, for scenarios that need a handler to be
    /// mid-flight when something else happens.
    pub delay: Duration,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedProcessor {
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedProcessor {
            script: Mutex::new(VecDeque::new()),
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn push_outcome(&self, outcome: ProcessOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn processed(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(
        &self,
        _ctx: &CancellationToken,
        request: Request,
        _credentials: &Credentials,
    ) -> ProcessOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(request.experiment.key.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(ProcessOutcome::success)
    }
}

pub struct Harness {
    pub mem: Arc<MemoryTransport>,
    pub backoffs: Arc<BackoffCache>,
    pub busy: Arc<BusySet>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<Registry>,
    pub processor: Arc<ScriptedProcessor>,
    pub lifecycle_tx: watch::Sender<NodeState>,
    pub ctx: CancellationToken,
    _workdir: tempfile::TempDir,
}

impl Harness {
    /// Stand up a full scheduler over the in-memory broker with the given
    /// queues pre-created, and spawn it.
    pub fn start(queues: &[&str], processor: Arc<ScriptedProcessor>) -> Harness {
        let mem = Arc::new(MemoryTransport::new());
        for q in queues {
            mem.create_queue(q);
        }

        let workdir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::new(vec![GpuBoard {
            slots: 2,
            mem: ByteQuantity::from_bytes(8_000_000_000),
        }]));
        ledger
            .disk
            .set_limits(workdir.path().to_str().unwrap(), ByteQuantity::ZERO)
            .unwrap();

        let backoffs = Arc::new(BackoffCache::new());
        let busy = Arc::new(BusySet::new());
        let (lifecycle_tx, lifecycle) = LifecycleGate::channel();
        let ctx = CancellationToken::new();

        let queue = Arc::new(
            AmqpQueue::new(
                "amqp://runner:pw@broker.local/studio",
                mem.clone() as Arc<dyn QueueTransport>,
            )
            .unwrap(),
        );

        let scheduler = ProjectScheduler::new(
            PROJECT,
            queue,
            backoffs.clone(),
            busy.clone(),
            ledger.clone(),
            processor.clone(),
            Arc::new(drover_scheduler::NoopNotifier),
            lifecycle,
            SchedulerConfig::default(),
        );
        let registry = scheduler.registry();

        backoffs.clone().spawn_sweeper(ctx.clone());
        tokio::spawn(scheduler.run(ctx.clone()));

        Harness {
            mem,
            backoffs,
            busy,
            ledger,
            registry,
            processor,
            lifecycle_tx,
            ctx,
            _workdir: workdir,
        }
    }

    pub fn fq(&self, queue: &str) -> String {
        drover_scheduler::fingerprint(PROJECT, queue)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// A payload whose needs fit any machine the tests run on.
pub fn small_payload(key: &str) -> String {
    format!(
        r#"{{
            "config": {{"experimentLifetime": "1h"}},
            "experiment": {{
                "key": "{key}",
                "filename": "train.py",
                "pythonver": 3,
                "resources_needed": {{"cpus": 0, "gpus": 0, "hdd": "1Kb", "ram": "1Kb"}}
            }}
        }}"#
    )
}

/// Poll `cond` until it holds or `timeout` elapses, returning whether it
/// held.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
