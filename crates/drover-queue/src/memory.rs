// An in-process broker implementing the transport seam.
//
// Carries real visibility semantics: a received message is invisible for its
// lease, reappears at the head of the queue when the lease lapses, and can be
// extended, acked, or nacked by receipt. Used by the integration tests and by
// `memory://` queue sources in local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::transport::{Delivery, QueueTransport, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-queue counters, exposed for assertions in tests and for the local
/// status endpoint.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// receive() calls issued against the queue, empty polls included.
    pub receives: u64,
    /// Messages actually handed to a caller.
    pub deliveries: u64,
    pub acks: u64,
    pub nacks: u64,
    pub extends: u64,
}

#[derive(Debug)]
struct InFlight {
    body: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    in_flight: HashMap<String, InFlight>,
    stats: QueueStats,
}

impl QueueState {
    /// Move any message whose lease has lapsed back to the head of the queue.
    fn reclaim(&mut self, now: Instant) {
        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for receipt in lapsed {
            if let Some(m) = self.in_flight.remove(&receipt) {
                self.ready.push_front(m.body);
            }
        }
    }
}

/// In-memory broker with lease/visibility semantics.
#[derive(Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    delisted: Mutex<HashSet<String>>,
    receipt_seq: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_queue(&self, name: &str) {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_default();
    }

    pub fn remove_queue(&self, name: &str) {
        self.queues.lock().remove(name);
    }

    /// Drop the queue from listings while leaving its in-flight messages
    /// settleable, the way broker-side deletion propagates: consumers stop
    /// seeing the queue before outstanding receipts go stale.
    pub fn delist_queue(&self, name: &str) {
        self.delisted.lock().insert(name.to_string());
    }

    /// Enqueue a message body onto an existing or new queue.
    pub fn push(&self, name: &str, body: impl Into<Vec<u8>>) {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_default()
            .ready
            .push_back(body.into());
    }

    pub fn depth(&self, name: &str) -> usize {
        self.queues
            .lock()
            .get(name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, name: &str) -> usize {
        self.queues
            .lock()
            .get(name)
            .map(|q| q.in_flight.len())
            .unwrap_or(0)
    }

    pub fn stats(&self, name: &str) -> QueueStats {
        self.queues
            .lock()
            .get(name)
            .map(|q| q.stats.clone())
            .unwrap_or_default()
    }

    fn next_receipt(&self) -> String {
        format!("r-{}", self.receipt_seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn list_queues(&self) -> Result<Vec<String>, TransportError> {
        let delisted = self.delisted.lock();
        let mut names: Vec<String> = self
            .queues
            .lock()
            .keys()
            .filter(|name| !delisted.contains(*name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn receive(
        &self,
        queue: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let wait_deadline = Instant::now() + wait;

        {
            let mut queues = self.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            state.stats.receives += 1;
        }

        loop {
            {
                let now = Instant::now();
                let mut queues = self.queues.lock();
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
                state.reclaim(now);
                if let Some(body) = state.ready.pop_front() {
                    let receipt = self.next_receipt();
                    state.in_flight.insert(
                        receipt.clone(),
                        InFlight {
                            body: body.clone(),
                            deadline: now + lease,
                        },
                    );
                    state.stats.deliveries += 1;
                    return Ok(Some(Delivery { receipt, body }));
                }
            }
            if Instant::now() >= wait_deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn extend(
        &self,
        queue: &str,
        receipt: &str,
        lease: Duration,
    ) -> Result<(), TransportError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        let m = state
            .in_flight
            .get_mut(receipt)
            .ok_or_else(|| TransportError::StaleReceipt(receipt.to_string()))?;
        m.deadline = Instant::now() + lease;
        state.stats.extends += 1;
        Ok(())
    }

    async fn ack(&self, queue: &str, receipt: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| TransportError::StaleReceipt(receipt.to_string()))?;
        state.stats.acks += 1;
        Ok(())
    }

    async fn nack(&self, queue: &str, receipt: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        let m = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| TransportError::StaleReceipt(receipt.to_string()))?;
        state.ready.push_front(m.body);
        state.stats.nacks += 1;
        Ok(())
    }
}
