//! # Beamflow
//!
//! Queue-driven coordinator that turns an uploaded image into a 3D asset.
//!
//! A task message names an image in the object store. The coordinator:
//!
//! - **Consumes** the task queue with bounded concurrency and at-least-once
//!   delivery, mapping every outcome onto ack or nack
//! - **Runs stages** in order: external commands as isolated subprocesses,
//!   and calls to the render service
//! - **Hands off** between processes with presence-only sentinels that
//!   exactly one watcher can take
//! - **Uploads** the resulting `.glb` files under the results prefix and
//!   removes the task's working directory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use beamflow::prelude::*;
//!
//! let store = Arc::new(BlobStore::for_url("gs://bucket")?);
//! let sentinels = Arc::new(FileSentinelStore::create("signals").await?);
//! let producer = Producer::new(store, sentinels, stages, ProducerSettings::new("work"))
//!     .with_render_invoker(Arc::new(HttpRenderInvoker::new(endpoint, timeout)?));
//!
//! let consumer = QueueConsumer::new(queue, ConsumerConfig::default());
//! consumer.consume(Arc::new(producer), shutdown).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod queue;
pub mod render;
pub mod sentinel;
pub mod stages;
pub mod storage;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{BeamflowConfig, ConfigOverrides};
    pub use crate::coordinator::{
        PipelineState, Producer, ProducerSettings, TaskWorkdir, Watcher, WatcherSettings,
    };
    pub use crate::core::{
        Outcome, OutputArtifact, SourceFilter, StageResult, StageStatus, Task, TaskMessage,
    };
    pub use crate::errors::{BeamflowError, ErrorClass};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::queue::{
        ConsumerConfig, InMemoryQueue, MessageQueue, QueueConsumer, RedeliveryPolicy, SpoolQueue,
        TaskHandler,
    };
    pub use crate::render::{HttpRenderInvoker, RenderInvoker};
    pub use crate::sentinel::{FileSentinelStore, InMemorySentinelStore, SentinelStore, WatchOptions};
    pub use crate::stages::{StageDefinition, StageRunner};
    pub use crate::storage::{BlobRef, BlobStore, ObjectStoreClient};
}
