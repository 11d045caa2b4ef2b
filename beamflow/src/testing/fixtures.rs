//! Test environment wiring in-memory backends to a temporary work root.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use crate::coordinator::{Producer, ProducerSettings, Watcher, WatcherSettings};
use crate::core::TaskMessage;
use crate::events::CollectingEventSink;
use crate::render::{RenderInvoker, GLB_MAGIC};
use crate::sentinel::InMemorySentinelStore;
use crate::stages::StageDefinition;
use crate::storage::BlobStore;

/// A small valid-looking binary glTF payload.
pub fn glb_bytes() -> Vec<u8> {
    let mut bytes = GLB_MAGIC.to_vec();
    bytes.extend_from_slice(&[2, 0, 0, 0, 12, 0, 0, 0]);
    bytes
}

/// A queue message body for an image under `fullbodyimages/`.
pub fn task_body(filename: &str) -> Vec<u8> {
    let message = TaskMessage::new(filename, format!("gs://bucket/fullbodyimages/{filename}"));
    serde_json::to_vec(&message).unwrap_or_default()
}

/// In-memory store, in-memory sentinels and a temporary work root.
pub struct TestEnv {
    /// Owns the temporary directory.
    pub dir: TempDir,
    /// Object store.
    pub store: Arc<BlobStore>,
    /// Sentinel store.
    pub sentinels: Arc<InMemorySentinelStore>,
    /// Captured events.
    pub events: Arc<CollectingEventSink>,
}

impl TestEnv {
    /// Creates a fresh environment.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}")),
            store: Arc::new(BlobStore::in_memory()),
            sentinels: Arc::new(InMemorySentinelStore::new()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Root of task working directories.
    pub fn work_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    /// Uploads a source image the way the ingestion endpoint would.
    pub async fn seed_image(&self, filename: &str) {
        self.store
            .put_bytes(&format!("fullbodyimages/{filename}"), b"\x89PNG fake image".to_vec())
            .await
            .unwrap_or_else(|e| panic!("seed {filename}: {e}"));
    }

    /// A producer running `stages`, optionally with a render invoker.
    pub fn producer(&self, stages: Vec<StageDefinition>, render: Option<Arc<dyn RenderInvoker>>) -> Producer {
        let producer = Producer::new(
            self.store.clone(),
            self.sentinels.clone(),
            stages,
            ProducerSettings::new(self.work_root()),
        )
        .with_event_sink(self.events.clone());
        match render {
            Some(render) => producer.with_render_invoker(render),
            None => producer,
        }
    }

    /// A watcher over the same store, sentinels and work root.
    pub fn watcher(&self) -> Watcher {
        Watcher::new(
            self.store.clone(),
            self.sentinels.clone(),
            WatcherSettings::new(self.work_root()),
        )
        .with_event_sink(self.events.clone())
    }
}
