//! Core domain model types for beamflow.
//!
//! This module contains the fundamental types shared by every component:
//! - Task and its queue message body
//! - The accept filter over task source objects
//! - Handler outcomes that drive ack/nack
//! - Stage results and output artifacts

mod artifact;
mod filter;
mod outcome;
mod result;
mod status;
mod task;

pub use artifact::{ContentKind, OutputArtifact};
pub use filter::SourceFilter;
pub use outcome::Outcome;
pub use result::StageResult;
pub use status::StageStatus;
pub use task::{is_valid_key, Task, TaskMessage};
