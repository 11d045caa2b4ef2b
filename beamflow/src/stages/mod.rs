//! Pipeline stages.
//!
//! A stage is either an external command run as a subprocess or a call to the
//! render service. Stages of a task run strictly in order; each stage's
//! declared outputs become the next stage's input.

mod runner;
mod spec;

pub use runner::{StageRunner, DEFAULT_TAIL_LINES};
pub use spec::{CommandStage, RenderStage, StageDefinition, StageSpec, TemplateVars};
