//! Per-task working directories.
//!
//! Every task gets `<work_root>/<key>/` with `input/` for the downloaded
//! source and `output/` for files the watcher uploads. Nothing is shared
//! between tasks.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::is_valid_key;
use crate::errors::BeamflowError;

/// The working directory of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkdir {
    root: PathBuf,
}

impl TaskWorkdir {
    /// Locates the workdir of `key` without touching the filesystem.
    pub fn locate(work_root: &Path, key: &str) -> Result<Self, BeamflowError> {
        if !is_valid_key(key) {
            return Err(BeamflowError::InvalidInput(format!(
                "'{key}' is not a valid task key"
            )));
        }
        Ok(Self {
            root: work_root.join(key),
        })
    }

    /// Clears any leftovers of a previous attempt and creates a fresh layout.
    pub async fn prepare(work_root: &Path, key: &str) -> Result<Self, BeamflowError> {
        let workdir = Self::locate(work_root, key)?;
        if workdir.remove().await? {
            debug!(task = key, "Removed stale working directory");
        }
        tokio::fs::create_dir_all(workdir.input_dir()).await?;
        tokio::fs::create_dir_all(workdir.output_dir()).await?;
        Ok(workdir)
    }

    /// The workdir itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the source download goes.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// Where uploadable outputs go.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Path of the downloaded source file.
    #[must_use]
    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.input_dir().join(filename)
    }

    /// Returns true if the workdir exists.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.root).await.unwrap_or(false)
    }

    /// Regular files in `output/` whose extension is in `extensions`,
    /// compared case-insensitively. Sorted by path.
    pub async fn outputs(&self, extensions: &[String]) -> Result<Vec<PathBuf>, BeamflowError> {
        let mut entries = match tokio::fs::read_dir(self.output_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
            if matches {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Deletes the workdir. Returns false if it did not exist.
    pub async fn remove(&self) -> Result<bool, BeamflowError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_clears_stale_leftovers() {
        let root = TempDir::new().unwrap();
        let stale = root.path().join("a/output/old.glb");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"stale").unwrap();

        let workdir = TaskWorkdir::prepare(root.path(), "a").await.unwrap();
        assert!(!stale.exists());
        assert!(workdir.input_dir().is_dir());
        assert!(workdir.output_dir().is_dir());
        assert_eq!(workdir.input_path("a.png"), root.path().join("a/input/a.png"));
    }

    #[tokio::test]
    async fn test_outputs_filter_by_extension() {
        let root = TempDir::new().unwrap();
        let workdir = TaskWorkdir::prepare(root.path(), "a").await.unwrap();
        for name in ["a.glb", "b.GLB", "a.obj", "notes.txt"] {
            std::fs::write(workdir.output_dir().join(name), b"x").unwrap();
        }
        std::fs::create_dir(workdir.output_dir().join("dir.glb")).unwrap();

        let outputs = workdir.outputs(&["glb".to_string()]).await.unwrap();
        assert_eq!(
            outputs,
            vec![workdir.output_dir().join("a.glb"), workdir.output_dir().join("b.GLB")]
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let root = TempDir::new().unwrap();
        let workdir = TaskWorkdir::prepare(root.path(), "a").await.unwrap();
        assert!(workdir.exists().await);
        assert!(workdir.remove().await.unwrap());
        assert!(!workdir.remove().await.unwrap());
        assert!(workdir.outputs(&["glb".to_string()]).await.unwrap().is_empty());
    }

    #[test]
    fn test_locate_rejects_traversal() {
        assert!(TaskWorkdir::locate(Path::new("/work"), "..").is_err());
        assert!(TaskWorkdir::locate(Path::new("/work"), "a/b").is_err());
    }
}
