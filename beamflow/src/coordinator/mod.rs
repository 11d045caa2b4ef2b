//! Pipeline coordinator.
//!
//! The [`Producer`] is the queue consumer's task handler: it fetches the
//! source image, runs the configured stages in order and posts a sentinel.
//! The [`Watcher`] takes that sentinel, uploads the outputs and removes the
//! working directory. The two only share the sentinel store and the work
//! root, so they can run in separate processes.

mod producer;
mod state;
mod watcher;
mod workdir;


pub use producer::{Producer, ProducerReport, ProducerSettings, SkipReason};
pub use state::{PipelineState, StateTracker};
pub use watcher::{Handoff, Watcher, WatcherSettings};
pub use workdir::TaskWorkdir;
