//! Filesystem sentinel store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{validate_name, Claim, SentinelStore};
use crate::errors::SentinelError;

const TAKEN_PREFIX: &str = ".taken-";
const CLAIMED_PREFIX: &str = ".claimed-";

/// Sentinels as empty marker files in one shared directory.
///
/// `take` renames the marker to a unique private name before deleting it.
/// Rename within a directory is atomic, so when several processes race only
/// one rename succeeds and the others see `NotFound`.
///
/// `claim` renames the marker to `.claimed-<name>` and stamps the claim time
/// into it. The claim file stays until `release`, so a crashed watcher's work
/// is visible to `recover_stale`.
#[derive(Debug, Clone)]
pub struct FileSentinelStore {
    dir: PathBuf,
}

impl FileSentinelStore {
    /// Uses `dir` as is. Operations fail if it does not exist.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates `dir` if needed and returns a store over it.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, SentinelError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SentinelError::Unavailable {
                dir: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    /// The sentinel directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn claim_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{CLAIMED_PREFIX}{name}"))
    }

    fn io_error(name: &str, source: std::io::Error) -> SentinelError {
        SentinelError::Io {
            name: name.to_string(),
            source,
        }
    }

    /// Age of a claim file, from its stamp or else its modification time.
    async fn claim_age(path: &Path) -> std::io::Result<Duration> {
        let stamp = tokio::fs::read_to_string(path).await?;
        if let Ok(claimed_at) = DateTime::parse_from_rfc3339(stamp.trim()) {
            let age = Utc::now().signed_duration_since(claimed_at.with_timezone(&Utc));
            return Ok(age.to_std().unwrap_or(Duration::ZERO));
        }
        let modified = tokio::fs::metadata(path).await?.modified()?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    async fn check_available(&self) -> Result<(), SentinelError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SentinelError::Unavailable {
                dir: self.dir.clone(),
                source: std::io::Error::new(ErrorKind::Other, "not a directory"),
            }),
            Err(source) => Err(SentinelError::Unavailable {
                dir: self.dir.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl SentinelStore for FileSentinelStore {
    async fn post(&self, name: &str) -> Result<(), SentinelError> {
        validate_name(name)?;
        self.check_available().await?;

        let result = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .await;

        match result {
            Ok(_) => {
                debug!(sentinel = name, "Sentinel posted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(SentinelError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn take(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available().await?;

        let claimed = self
            .dir
            .join(format!("{TAKEN_PREFIX}{name}-{}", uuid::Uuid::new_v4()));

        match tokio::fs::rename(self.path(name), &claimed).await {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(&claimed).await {
                    warn!(sentinel = name, error = %e, "Failed to remove claimed sentinel marker");
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Absent sentinel and vanished directory look the same to rename.
                self.check_available().await?;
                Ok(false)
            }
            Err(source) => Err(SentinelError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn claim(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available().await?;

        let claimed = self.claim_path(name);
        match tokio::fs::rename(self.path(name), &claimed).await {
            Ok(()) => {
                tokio::fs::write(&claimed, Utc::now().to_rfc3339())
                    .await
                    .map_err(|source| Self::io_error(name, source))?;
                debug!(sentinel = name, "Sentinel claimed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.check_available().await?;
                Ok(false)
            }
            Err(source) => Err(Self::io_error(name, source)),
        }
    }

    async fn release(&self, name: &str) -> Result<(), SentinelError> {
        validate_name(name)?;
        self.check_available().await?;

        match tokio::fs::remove_file(self.claim_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Self::io_error(name, source)),
        }
    }

    async fn restore(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available().await?;

        match tokio::fs::rename(self.claim_path(name), self.path(name)).await {
            Ok(()) => {
                debug!(sentinel = name, "Claim restored to pending");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.check_available().await?;
                Ok(false)
            }
            Err(source) => Err(Self::io_error(name, source)),
        }
    }

    async fn claimed(&self, prefix: &str) -> Result<Vec<Claim>, SentinelError> {
        let mut claims = Vec::new();
        for file_name in self.list_names().await? {
            let Some(name) = file_name.strip_prefix(CLAIMED_PREFIX) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            match Self::claim_age(&self.dir.join(&file_name)).await {
                Ok(age) => claims.push(Claim {
                    name: name.to_string(),
                    age,
                }),
                // Released or restored while listing.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(Self::io_error(name, source)),
            }
        }
        claims.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(claims)
    }

    async fn pending(&self, prefix: &str) -> Result<Vec<String>, SentinelError> {
        let mut names: Vec<String> = self
            .list_names()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('.') && name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }
}

impl FileSentinelStore {
    async fn list_names(&self) -> Result<Vec<String>, SentinelError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| SentinelError::Unavailable {
                dir: self.dir.clone(),
                source,
            })?;

        let mut names = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| SentinelError::Unavailable {
                    dir: self.dir.clone(),
                    source,
                })?;
            let Some(entry) = entry else { break };
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}
