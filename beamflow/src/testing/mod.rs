//! Shared fixtures for the crate's tests.

mod fixtures;
mod mocks;

pub use fixtures::{glb_bytes, task_body, TestEnv};
pub use mocks::ScriptedRenderInvoker;
