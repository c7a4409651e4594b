// The polling scheduler at the heart of the drover runner.
//
// A producer ranks the known queues every tick and offers one idle candidate
// to the consumer over a rendezvous channel; the consumer gates the candidate
// on back-off state, a per-queue busy claim, and a resource fit check before
// asking the queue adapter for work. Terminal outcomes from the processor are
// translated into broker acknowledgements and fresh back-off entries.
//
// The ledgers, busy set, and back-off cache are process-wide: they are
// created once during startup and shared by every project's scheduler.

pub mod backoff;
pub mod busy;
pub mod consumer;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod notify;
pub mod producer;
pub mod registry;
pub mod scheduler;

pub use backoff::BackoffCache;
pub use busy::{BusyGuard, BusySet};
pub use consumer::{Consumer, ConsumerConfig, ProcessOutcome, Processor};
pub use error::{Result, SchedulerError};
pub use ledger::{GpuBoard, Ledger, TaskReservation};
pub use lifecycle::{run_state_file_poller, LifecycleGate, NodeState};
pub use notify::{NoopNotifier, Notifier};
pub use producer::{fingerprint, Producer, ProducerConfig, ProbeRequest, QueueProbe};
pub use registry::{RankedSubscription, RefreshConfig, Registry};
pub use scheduler::{ProjectScheduler, SchedulerConfig};
