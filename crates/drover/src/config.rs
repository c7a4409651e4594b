// Command line and environment surface for the runner binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use drover_core::ByteQuantity;
use drover_scheduler::GpuBoard;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Distributed task runner draining work from message queues")]
#[command(version)]
pub struct Cli {
    /// Regular expression selecting which queue names to consider
    #[arg(long = "queue-match", env = "DROVER_QUEUE_MATCH")]
    pub queue_match: String,

    /// Project identifier for a pub/sub or SQS style broker
    #[arg(long, env = "DROVER_PROJECT")]
    pub project: Option<String>,

    /// Credentials for the project: a service-account .json file selects
    /// pub/sub, a comma-separated list of files selects SQS
    #[arg(long, env = "DROVER_CREDENTIALS")]
    pub credentials: Option<String>,

    /// AMQP broker URL with embedded credentials; empty disables AMQP
    #[arg(long = "amqp-url", env = "AMQP_URL", default_value = "")]
    pub amqp_url: String,

    /// Seconds allowed for discrete SQS and AMQP operations
    #[arg(long = "sqs-timeout", default_value_t = 15)]
    pub sqs_timeout_secs: u64,

    /// Seconds allowed for discrete pub/sub operations
    #[arg(long = "pubsub-timeout", default_value_t = 5)]
    pub pubsub_timeout_secs: u64,

    /// Service account file for the experiment metadata store; must be
    /// readable by the runner alone (mode 0600)
    #[arg(long = "firebase-account-file", env = "FIREBASE_ACCOUNT_FILE")]
    pub firebase_account_file: Option<PathBuf>,

    /// Root directory for task workspaces; its filesystem is what the disk
    /// ledger tracks
    #[arg(long = "root-dir", env = "DROVER_ROOT_DIR", default_value = "/tmp/drover")]
    pub root_dir: PathBuf,

    /// Free space to preserve on the workspace filesystem, e.g. "10Gb"
    #[arg(long = "min-free", default_value = "")]
    pub min_free: String,

    /// GPU board available to tasks as slots:memory, e.g. "4:16GiB";
    /// repeat per board
    #[arg(long = "gpu-board")]
    pub gpu_boards: Vec<String>,

    /// Webhook for operator notifications; unset disables them
    #[arg(long = "notify-url", env = "DROVER_NOTIFY_URL")]
    pub notify_url: Option<String>,

    /// Lifecycle state file a cluster controller writes
    /// (running / drain / suspended); absent means running
    #[arg(long = "state-file", env = "DROVER_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Directory backing the local artifact store
    #[arg(long = "artifact-root")]
    pub artifact_root: Option<PathBuf>,
}

impl Cli {
    pub fn min_free(&self) -> Result<ByteQuantity> {
        self.min_free
            .parse()
            .with_context(|| format!("bad --min-free {:?}", self.min_free))
    }

    pub fn gpu_inventory(&self) -> Result<Vec<GpuBoard>> {
        self.gpu_boards.iter().map(|s| parse_gpu_board(s)).collect()
    }
}

/// Parse a board description of the form `slots:memory`.
pub fn parse_gpu_board(text: &str) -> Result<GpuBoard> {
    let (slots, mem) = text
        .split_once(':')
        .with_context(|| format!("--gpu-board {text:?} is not slots:memory"))?;
    let slots: u32 = slots
        .parse()
        .with_context(|| format!("bad slot count in --gpu-board {text:?}"))?;
    let mem: ByteQuantity = mem
        .parse()
        .with_context(|| format!("bad memory size in --gpu-board {text:?}"))?;
    Ok(GpuBoard { slots, mem })
}

/// Account files hold long-lived credentials; anything looser than 0600 is
/// refused outright.
pub fn check_account_file(path: &Path) -> Result<()> {
    let meta =
        fs::metadata(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        bail!(
            "file permissions for {} are too liberal ({:o}); fix with 'chmod 0600 {}'",
            path.display(),
            mode,
            path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_boards() {
        let board = parse_gpu_board("4:16GiB").unwrap();
        assert_eq!(board.slots, 4);
        assert_eq!(board.mem.as_u64(), 16 * 1024 * 1024 * 1024);

        assert!(parse_gpu_board("4").is_err());
        assert!(parse_gpu_board("four:16GiB").is_err());
        assert!(parse_gpu_board("4:lots").is_err());
    }

    #[test]
    fn account_file_permissions_are_enforced() {
        let file = tempfile::NamedTempFile::new().unwrap();

        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644)).unwrap();
        assert!(check_account_file(file.path()).is_err());

        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600)).unwrap();
        check_account_file(file.path()).unwrap();
    }

    #[test]
    fn cli_parses_a_minimal_invocation() {
        let cli = Cli::try_parse_from([
            "drover",
            "--queue-match",
            "^studio_",
            "--project",
            "memory://sandbox",
            "--credentials",
            "/dev/null",
        ])
        .unwrap();
        assert_eq!(cli.queue_match, "^studio_");
        assert_eq!(cli.root_dir, PathBuf::from("/tmp/drover"));
        assert!(cli.min_free().unwrap().is_zero());
        assert!(cli.gpu_inventory().unwrap().is_empty());
    }
}
