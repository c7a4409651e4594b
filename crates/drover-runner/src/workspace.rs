// Per-task directory layout on the executing node.
//
// Each task gets `<root>/<key>/` with the fixed set of subdirectories the
// submitting tooling expects. Generated filenames carry the host and a
// base62-encoded creation time; the stamp is fixed at workspace creation so
// repeated checkpoint writes overwrite the same file.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, RunnerError};

const SUBDIRS: &[&str] = &[
    "_metadata",
    "_metrics",
    "modeldir",
    "output",
    "tb",
    "workspace",
    "_runner",
];

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encode seconds-since-epoch (or any counter) in base62.
pub fn base62(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE62[(n % 62) as usize]);
        n /= 62;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// The staged directory tree for one task.
#[derive(Debug)]
pub struct TaskWorkspace {
    dir: PathBuf,
    host: String,
    stamp: String,
}

impl TaskWorkspace {
    /// Create `<root>/<key>/` and its subdirectories. The `_runner`
    /// directory holding the generated script is private to the runner.
    pub fn create(root: &Path, key: &str, host: &str) -> Result<TaskWorkspace> {
        let dir = root.join(key);
        for sub in SUBDIRS {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| RunnerError::io(&path, e))?;
        }
        let runner_dir = dir.join("_runner");
        fs::set_permissions(&runner_dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| RunnerError::io(&runner_dir, e))?;

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Ok(TaskWorkspace {
            dir,
            host: host.to_string(),
            stamp: base62(secs),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.dir.join("workspace")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.dir.join("_metadata")
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join("_runner").join("runner.sh")
    }

    /// The raw process output artifact.
    pub fn output_file(&self) -> PathBuf {
        self.output_dir().join("output")
    }

    /// `_metadata/<kind>-<host>-<stamp>.<ext>`; stable per task so updates
    /// overwrite rather than accumulate.
    pub fn metadata_file(&self, kind: &str, ext: &str) -> PathBuf {
        self.metadata_dir()
            .join(format!("{kind}-{}-{}.{ext}", self.host, self.stamp))
    }

    /// Where an artifact lands inside the workspace tree. An explicit
    /// `local` path in the artifact wins, otherwise the artifact name is a
    /// directory directly under the task root.
    pub fn artifact_dir(&self, name: &str, local: Option<&str>) -> PathBuf {
        match local {
            Some(local) => self.dir.join(local),
            None => self.dir.join(name),
        }
    }

    /// Tear the whole task directory down.
    pub fn remove(self) -> Result<()> {
        fs::remove_dir_all(&self.dir).map_err(|e| RunnerError::io(&self.dir, e))
    }
}
