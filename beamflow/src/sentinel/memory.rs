//! In-memory sentinel store.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::{validate_name, Claim, SentinelStore};
use crate::errors::SentinelError;

/// Process-local sentinel store backed by a concurrent set.
///
/// Removal from the set is atomic, which gives `take` its compare-and-delete
/// semantics. Can be switched to "unavailable" to exercise error paths.
#[derive(Debug)]
pub struct InMemorySentinelStore {
    present: DashSet<String>,
    claims: DashMap<String, Instant>,
    available: AtomicBool,
}

impl Default for InMemorySentinelStore {
    fn default() -> Self {
        Self {
            present: DashSet::new(),
            claims: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemorySentinelStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the sentinel is currently present.
    #[must_use]
    pub fn is_present(&self, name: &str) -> bool {
        self.present.contains(name)
    }

    /// Returns true if the sentinel is currently claimed.
    #[must_use]
    pub fn is_claimed(&self, name: &str) -> bool {
        self.claims.contains_key(name)
    }

    /// Returns the number of present sentinels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Returns true if no sentinel is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Simulates the backing storage going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SentinelError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SentinelError::Unavailable {
                dir: PathBuf::from("memory://"),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "store offline"),
            })
        }
    }
}

#[async_trait]
impl SentinelStore for InMemorySentinelStore {
    async fn post(&self, name: &str) -> Result<(), SentinelError> {
        validate_name(name)?;
        self.check_available()?;
        self.present.insert(name.to_string());
        Ok(())
    }

    async fn take(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available()?;
        Ok(self.present.remove(name).is_some())
    }

    async fn claim(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available()?;
        if self.present.remove(name).is_none() {
            return Ok(false);
        }
        self.claims.insert(name.to_string(), Instant::now());
        Ok(true)
    }

    async fn release(&self, name: &str) -> Result<(), SentinelError> {
        validate_name(name)?;
        self.check_available()?;
        self.claims.remove(name);
        Ok(())
    }

    async fn restore(&self, name: &str) -> Result<bool, SentinelError> {
        validate_name(name)?;
        self.check_available()?;
        if self.claims.remove(name).is_none() {
            return Ok(false);
        }
        self.present.insert(name.to_string());
        Ok(true)
    }

    async fn claimed(&self, prefix: &str) -> Result<Vec<Claim>, SentinelError> {
        self.check_available()?;
        let mut claims: Vec<Claim> = self
            .claims
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| Claim {
                name: entry.key().clone(),
                age: entry.value().elapsed(),
            })
            .collect();
        claims.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(claims)
    }

    async fn pending(&self, prefix: &str) -> Result<Vec<String>, SentinelError> {
        self.check_available()?;
        let mut names: Vec<String> = self
            .present
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
