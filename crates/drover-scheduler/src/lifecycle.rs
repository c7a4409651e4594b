// Node lifecycle gating.
//
// A cluster controller can ask the node to stop taking new work without
// touching anything already running. The producer polls a local copy of the
// state each tick, so a transition is observed within one tick.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Externally driven node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Running,
    /// Finish in-flight work, take nothing new.
    Drain,
    /// Fully suspended; also takes nothing new.
    Suspended,
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(NodeState::Running),
            "drain" | "draining" => Ok(NodeState::Drain),
            "suspended" => Ok(NodeState::Suspended),
            other => Err(format!("unknown node state {other:?}")),
        }
    }
}

/// Read side of the lifecycle stream, cloned into each producer.
#[derive(Debug, Clone)]
pub struct LifecycleGate {
    rx: watch::Receiver<NodeState>,
}

impl LifecycleGate {
    /// A new gate in the `Running` state, with the sender the binary uses
    /// to publish transitions.
    pub fn channel() -> (watch::Sender<NodeState>, LifecycleGate) {
        let (tx, rx) = watch::channel(NodeState::Running);
        (tx, LifecycleGate { rx })
    }

    pub fn current(&self) -> NodeState {
        *self.rx.borrow()
    }

    /// Only `Running` permits new probes.
    pub fn is_running(&self) -> bool {
        self.current() == NodeState::Running
    }
}

/// Poll a state file a controller touches and publish transitions.
/// An absent file means `Running`.
pub async fn run_state_file_poller(
    path: PathBuf,
    tx: watch::Sender<NodeState>,
    interval: Duration,
    ctx: CancellationToken,
) {
    debug!(path = %path.display(), "started lifecycle state poller");
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match text.parse::<NodeState>() {
                Ok(s) => s,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable state file");
                    continue;
                }
            },
            Err(_) => NodeState::Running,
        };

        if *tx.borrow() != state {
            info!(?state, "node lifecycle transition");
            let _ = tx.send(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_names() {
        assert_eq!("running".parse::<NodeState>().unwrap(), NodeState::Running);
        assert_eq!("Drain".parse::<NodeState>().unwrap(), NodeState::Drain);
        assert_eq!(
            " suspended\n".parse::<NodeState>().unwrap(),
            NodeState::Suspended
        );
        assert!("paused".parse::<NodeState>().is_err());
    }

    #[test]
    fn gate_tracks_the_sender() {
        let (tx, gate) = LifecycleGate::channel();
        assert!(gate.is_running());

        tx.send(NodeState::Drain).unwrap();
        assert_eq!(gate.current(), NodeState::Drain);
        assert!(!gate.is_running());

        tx.send(NodeState::Running).unwrap();
        assert!(gate.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_publishes_file_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (tx, gate) = LifecycleGate::channel();
        let ctx = CancellationToken::new();

        let poller = tokio::spawn(run_state_file_poller(
            path.clone(),
            tx,
            Duration::from_millis(100),
            ctx.clone(),
        ));

        tokio::fs::write(&path, "drain").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(gate.current(), NodeState::Drain);

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(gate.current(), NodeState::Running);

        ctx.cancel();
        poller.await.unwrap();
    }
}
