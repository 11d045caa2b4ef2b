//! Logging setup and timing helpers.

mod logging;
mod tracing;

pub use logging::{init_logging, LogFormat};
pub use tracing::{SpanTimer, StageSpanAttributes};
