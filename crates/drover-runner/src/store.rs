// Artifact movement seam.
//
// Object-store transports live outside this workspace; the runner only needs
// fetch-into-workspace and publish-from-workspace. The local filesystem
// implementation backs tests and single-machine runs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use drover_core::Artifact;

use crate::error::{Result, RunnerError};

/// Moves artifacts between storage and the task workspace.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Materialize the artifact under `dest`.
    async fn fetch(&self, name: &str, artifact: &Artifact, dest: &Path) -> Result<()>;

    /// Upload a mutable artifact's directory back to storage.
    async fn publish(&self, name: &str, artifact: &Artifact, src: &Path) -> Result<()>;
}

/// Filesystem-backed store, `<root>/<bucket>/<key>`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> LocalStore {
        LocalStore { root: root.into() }
    }

    fn object_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.bucket).join(&artifact.key)
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn fetch(&self, name: &str, artifact: &Artifact, dest: &Path) -> Result<()> {
        let src = self.object_path(artifact);
        if !src.exists() {
            return Err(RunnerError::Artifact {
                name: name.to_string(),
                reason: format!("{} not found", src.display()),
            });
        }
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| RunnerError::io(dest, e))?;
        let target = dest.join(
            src.file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "artifact".into()),
        );
        tokio::fs::copy(&src, &target)
            .await
            .map_err(|e| RunnerError::io(&target, e))?;
        debug!(name, src = %src.display(), dest = %target.display(), "artifact fetched");
        Ok(())
    }

    async fn publish(&self, name: &str, artifact: &Artifact, src: &Path) -> Result<()> {
        if !artifact.mutable {
            return Ok(());
        }
        let dest = self.object_path(artifact);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunnerError::io(parent, e))?;
        }

        // Directories are published file by file, flat; a single file is
        // copied as the object itself.
        let meta = tokio::fs::metadata(src)
            .await
            .map_err(|e| RunnerError::io(src, e))?;
        if meta.is_file() {
            tokio::fs::copy(src, &dest)
                .await
                .map_err(|e| RunnerError::io(&dest, e))?;
        } else {
            tokio::fs::create_dir_all(&dest)
                .await
                .map_err(|e| RunnerError::io(&dest, e))?;
            let mut entries = tokio::fs::read_dir(src)
                .await
                .map_err(|e| RunnerError::io(src, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RunnerError::io(src, e))?
            {
                let path = entry.path();
                if path.is_file() {
                    let target = dest.join(entry.file_name());
                    tokio::fs::copy(&path, &target)
                        .await
                        .map_err(|e| RunnerError::io(&target, e))?;
                }
            }
        }
        debug!(name, dest = %dest.display(), "artifact published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(bucket: &str, key: &str, mutable: bool) -> Artifact {
        Artifact {
            bucket: bucket.into(),
            key: key.into(),
            mutable,
            ..Artifact::default()
        }
    }

    #[tokio::test]
    async fn fetch_copies_the_object_in() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(store_dir.path().join("experiments")).unwrap();
        std::fs::write(store_dir.path().join("experiments/data.bin"), b"payload").unwrap();

        let store = LocalStore::new(store_dir.path());
        store
            .fetch(
                "data",
                &artifact("experiments", "data.bin", false),
                work_dir.path(),
            )
            .await
            .unwrap();

        let copied = std::fs::read(work_dir.path().join("data.bin")).unwrap();
        assert_eq!(copied, b"payload");
    }

    #[tokio::test]
    async fn fetch_of_a_missing_object_fails() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(store_dir.path());
        let r = store
            .fetch(
                "data",
                &artifact("experiments", "ghost.bin", false),
                work_dir.path(),
            )
            .await;
        assert!(matches!(r, Err(RunnerError::Artifact { .. })));
    }

    #[tokio::test]
    async fn publish_moves_mutable_directories_back() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(work_dir.path().join("weights.h5"), b"model").unwrap();

        let store = LocalStore::new(store_dir.path());
        store
            .publish(
                "modeldir",
                &artifact("experiments", "modeldir", true),
                work_dir.path(),
            )
            .await
            .unwrap();

        let out = store_dir.path().join("experiments/modeldir/weights.h5");
        assert_eq!(std::fs::read(out).unwrap(), b"model");
    }

    #[tokio::test]
    async fn immutable_artifacts_are_never_published() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(work_dir.path().join("input.txt"), b"x").unwrap();

        let store = LocalStore::new(store_dir.path());
        store
            .publish(
                "workspace",
                &artifact("experiments", "workspace", false),
                work_dir.path(),
            )
            .await
            .unwrap();
        assert!(!store_dir.path().join("experiments/workspace").exists());
    }
}
