//! Render invokers with scripted responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::RenderError;
use crate::render::RenderInvoker;

/// Returns queued responses in order, then repeats the fallback.
pub struct ScriptedRenderInvoker {
    script: Mutex<VecDeque<Result<Vec<u8>, RenderError>>>,
    fallback: Vec<u8>,
    calls: AtomicUsize,
}

impl ScriptedRenderInvoker {
    /// Always succeeds with `asset`.
    pub fn succeeding(asset: Vec<u8>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: asset,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails with each of `errors` in turn, then succeeds with `asset`.
    pub fn failing_then(errors: Vec<RenderError>, asset: Vec<u8>) -> Self {
        Self {
            script: Mutex::new(errors.into_iter().map(Err).collect()),
            fallback: asset,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderInvoker for ScriptedRenderInvoker {
    async fn invoke(&self, _image: Vec<u8>) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
