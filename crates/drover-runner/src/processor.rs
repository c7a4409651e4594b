// The processor facade the scheduler dispatches into.
//
// `TaskHost` owns the whole life of one accepted message: resource
// reservation, workspace staging, artifact fetch, script generation,
// subprocess supervision, metadata scraping, artifact publish, and teardown.
// Every failure is folded into the `(backoff, ack)` verdict the dispatcher
// translates for the broker; only ledger corruption escalates, by cancelling
// the process-wide shutdown token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_core::Request;
use drover_queue::Credentials;
use drover_scheduler::{Ledger, ProcessOutcome, Processor, TaskReservation};

use crate::error::RunnerError;
use crate::exec::run_script;
use crate::scrape::MetadataScraper;
use crate::script::write_script;
use crate::store::ArtifactStore;
use crate::workspace::TaskWorkspace;

#[derive(Debug, Clone)]
pub struct TaskHostConfig {
    /// Parent directory for per-task workspaces.
    pub root: PathBuf,
    /// Back-off reported for retryable failures.
    pub failure_backoff: Duration,
    /// Back-off reported when a task spec can never run.
    pub bad_spec_backoff: Duration,
}

impl TaskHostConfig {
    pub fn new(root: impl Into<PathBuf>) -> TaskHostConfig {
        TaskHostConfig {
            root: root.into(),
            failure_backoff: Duration::from_secs(30),
            bad_spec_backoff: Duration::from_secs(5 * 60),
        }
    }
}

pub struct TaskHost {
    config: TaskHostConfig,
    ledger: Arc<Ledger>,
    store: Arc<dyn ArtifactStore>,
    /// Cancelled when the ledger reports corruption; the binary treats that
    /// as a full shutdown.
    shutdown: CancellationToken,
    host: String,
}

impl TaskHost {
    pub fn new(
        config: TaskHostConfig,
        ledger: Arc<Ledger>,
        store: Arc<dyn ArtifactStore>,
        shutdown: CancellationToken,
    ) -> TaskHost {
        TaskHost {
            config,
            ledger,
            store,
            shutdown,
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        }
    }

    fn validate(&self, request: &Request) -> Result<Option<Duration>, RunnerError> {
        let experiment = &request.experiment;
        if experiment.key.is_empty() {
            return Err(RunnerError::BadSpec("experiment key is empty".to_string()));
        }
        if experiment.key.contains('/') || experiment.key.contains("..") {
            return Err(RunnerError::BadSpec(format!(
                "experiment key {:?} is not a safe path",
                experiment.key
            )));
        }
        if experiment.filename.is_empty() {
            return Err(RunnerError::BadSpec(
                "experiment filename is empty".to_string(),
            ));
        }
        if !(2..=3).contains(&experiment.python_ver) {
            return Err(RunnerError::BadSpec(format!(
                "unsupported interpreter version {}",
                experiment.python_ver
            )));
        }

        let lifetime = parse_duration(&request.config.lifetime)
            .map_err(|e| RunnerError::BadSpec(format!("bad experimentLifetime: {e}")))?;
        let max_duration = parse_duration(&experiment.max_duration)
            .map_err(|e| RunnerError::BadSpec(format!("bad max_duration: {e}")))?;

        Ok(match (lifetime, max_duration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    async fn stage_and_run(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        workspace: &TaskWorkspace,
        lifetime: Option<Duration>,
    ) -> Result<i32, ProcessOutcome> {
        let experiment = &request.experiment;

        for (name, artifact) in &experiment.artifacts {
            if artifact.key.is_empty() {
                continue;
            }
            let dest = workspace.artifact_dir(name, artifact.local.as_deref());
            if let Err(err) = self.store.fetch(name, artifact, &dest).await {
                if artifact.mutable {
                    // Mutable artifacts legitimately may not exist yet.
                    warn!(artifact = %name, error = %err, "mutable artifact not fetched");
                    continue;
                }
                return Err(ProcessOutcome::retry(
                    self.config.failure_backoff,
                    format!("artifact {name} fetch failed: {err}"),
                ));
            }
        }

        let has_gpu = experiment.resource.gpus > 0;
        let script = write_script(request, workspace, has_gpu, &self.host).map_err(|err| {
            ProcessOutcome::retry(
                self.config.failure_backoff,
                format!("script generation failed: {err}"),
            )
        })?;

        let scraper = Arc::new(MetadataScraper::new());
        let code = run_script(
            ctx,
            &script,
            &workspace.output_file(),
            lifetime,
            scraper.clone(),
        )
        .await
        .map_err(|err: RunnerError| {
            ProcessOutcome::retry(self.config.failure_backoff, err.to_string())
        })?;

        // Persist the accumulated metadata document and a copy of the raw
        // output under the names the metadata artifact expects.
        if let Err(err) = scraper.write_to(&workspace.metadata_file("scrape", "json")) {
            return Err(ProcessOutcome::retry(
                self.config.failure_backoff,
                format!("metadata persist failed: {err}"),
            ));
        }
        if let Err(err) = std::fs::copy(
            workspace.output_file(),
            workspace.metadata_file("output", "log"),
        ) {
            warn!(error = %err, "output log copy failed");
        }

        for (name, artifact) in &experiment.artifacts {
            if !artifact.mutable {
                continue;
            }
            let src = workspace.artifact_dir(name, artifact.local.as_deref());
            if let Err(err) = self.store.publish(name, artifact, &src).await {
                // Losing results is a failure even when the task itself
                // finished; redeliver and let a retry republish.
                return Err(ProcessOutcome::retry(
                    self.config.failure_backoff,
                    format!("artifact {name} publish failed: {err}"),
                ));
            }
        }

        Ok(code)
    }

    fn teardown(&self, workspace: TaskWorkspace, reservation: TaskReservation) {
        if let Err(err) = workspace.remove() {
            warn!(error = %err, "workspace removal failed");
        }
        if let Err(err) = self.ledger.release(reservation) {
            warn!(error = %err, "reservation release failed");
        }
    }
}

#[async_trait]
impl Processor for TaskHost {
    async fn process(
        &self,
        ctx: &CancellationToken,
        request: Request,
        _credentials: &Credentials,
    ) -> ProcessOutcome {
        let lifetime = match self.validate(&request) {
            Ok(l) => l,
            Err(err @ RunnerError::BadSpec(_)) => {
                return ProcessOutcome::discard(self.config.bad_spec_backoff, err.to_string());
            }
            Err(err) => {
                return ProcessOutcome::retry(self.config.failure_backoff, err.to_string());
            }
        };

        let reservation = match self.ledger.alloc(&request.experiment.resource) {
            Ok(r) => r,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "resource ledger corrupted, requesting shutdown");
                self.shutdown.cancel();
                return ProcessOutcome::retry(self.config.failure_backoff, err.to_string());
            }
            Err(err) => {
                return ProcessOutcome::retry(
                    self.config.failure_backoff,
                    format!("resources unavailable: {err}"),
                );
            }
        };

        let workspace =
            match TaskWorkspace::create(&self.config.root, &request.experiment.key, &self.host) {
                Ok(ws) => ws,
                Err(err) => {
                    if let Err(release_err) = self.ledger.release(reservation) {
                        warn!(error = %release_err, "reservation release failed");
                    }
                    return ProcessOutcome::retry(
                        self.config.failure_backoff,
                        format!("workspace staging failed: {err}"),
                    );
                }
            };

        info!(
            experiment = %request.experiment.key,
            dir = %workspace.dir().display(),
            "task starting"
        );

        let result = self
            .stage_and_run(ctx, &request, &workspace, lifetime)
            .await;
        self.teardown(workspace, reservation);

        match result {
            Ok(0) => ProcessOutcome::success(),
            Ok(code) => ProcessOutcome::retry(
                self.config.failure_backoff,
                format!("task exited with status {code}"),
            ),
            Err(outcome) => outcome,
        }
    }
}

/// Parse a compound duration like "24h", "30m", "1h30m", or "90s". Empty
/// input means no limit.
pub fn parse_duration(text: &str) -> Result<Option<Duration>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("{text:?} is not a duration"))?;
        digits.clear();
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            other => return Err(format!("unknown duration unit {other:?} in {text:?}")),
        };
        total += Duration::from_secs(value * unit);
    }
    if !digits.is_empty() {
        return Err(format!("{text:?} is missing a trailing unit"));
    }
    Ok(Some(total))
}
