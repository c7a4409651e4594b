// Subprocess supervision for the generated runner script.
//
// The script runs under bash with a private TMPDIR. Both output streams are
// pumped line-wise into the task's output artifact with a bounded flush
// cadence; stdout lines additionally feed the metadata scraper. Cancellation
// and the task's lifetime ceiling both kill the process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};
use crate::scrape::MetadataScraper;

/// How long buffered output may sit before being forced to disk.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Run the script to completion, returning its exit code. A process that
/// dies without one (signalled, cancelled, or over its lifetime) reports -1.
pub async fn run_script(
    ctx: &CancellationToken,
    script: &Path,
    output_file: &Path,
    lifetime: Option<Duration>,
    scraper: Arc<MetadataScraper>,
) -> Result<i32> {
    // pip and friends leave droppings behind; give the task its own TMPDIR
    // that vanishes with the run.
    let tmp = tempfile::tempdir().map_err(|e| RunnerError::io("tmpdir", e))?;
    let work_dir = script
        .parent()
        .ok_or_else(|| RunnerError::Process(format!("script {} has no parent", script.display())))?;

    let mut child = Command::new("/bin/bash")
        .arg("-c")
        .arg(format!(
            "export TMPDIR={}; {}",
            tmp.path().display(),
            script.display()
        ))
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunnerError::Process(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Process("stdout unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::Process("stderr unavailable".into()))?;

    let (line_tx, line_rx) = mpsc::channel::<OutputLine>(256);

    let stdout_pump = {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(OutputLine::Stdout(line)).await.is_err() {
                    break;
                }
            }
        })
    };
    let stderr_pump = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(OutputLine::Stderr(line)).await.is_err() {
                break;
            }
        }
    });

    let writer = spawn_output_writer(output_file.to_path_buf(), line_rx, scraper);

    let mut exited = None;
    tokio::select! {
        status = child.wait() => {
            exited = Some(status.map_err(|e| RunnerError::Process(e.to_string()))?);
        }
        _ = ctx.cancelled() => {
            warn!(script = %script.display(), "task cancelled, killing process");
        }
        _ = sleep_forever_or(lifetime) => {
            warn!(script = %script.display(), "task exceeded its lifetime, killing process");
        }
    }
    let status = match exited {
        Some(status) => status,
        None => {
            let _ = child.kill().await;
            child
                .wait()
                .await
                .map_err(|e| RunnerError::Process(e.to_string()))?
        }
    };

    // Let the pumps drain whatever is left in the pipes; the writer ends
    // when both pumps have dropped their sender.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    let _ = writer.await;

    let code = status.code().unwrap_or(-1);
    debug!(script = %script.display(), code, "task process finished");
    Ok(code)
}

async fn sleep_forever_or(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn spawn_output_writer(
    path: std::path::PathBuf,
    mut lines: mpsc::Receiver<OutputLine>,
    scraper: Arc<MetadataScraper>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot create output file");
                // Drain the channel so the pumps do not block on a full
                // buffer behind a missing file.
                while lines.recv().await.is_some() {}
                return;
            }
        };
        let mut out = BufWriter::new(file);
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.recv() => {
                    let text = match line {
                        None => break,
                        Some(OutputLine::Stdout(text)) => {
                            scraper.ingest_line(&text);
                            text
                        }
                        Some(OutputLine::Stderr(text)) => text,
                    };
                    if out.write_all(text.as_bytes()).await.is_err()
                        || out.write_all(b"\n").await.is_err()
                    {
                        warn!(path = %path.display(), "output write failed");
                        break;
                    }
                }
                _ = flush.tick() => {
                    let _ = out.flush().await;
                }
            }
        }
        let _ = out.flush().await;
    })
}
