//! Subprocess stage runner.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::StageSpec;
use crate::core::StageResult;
use crate::observability::SpanTimer;

/// Default number of output lines kept for failure details.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// How long to wait for output pumps after the child is gone.
const PUMP_GRACE: Duration = Duration::from_secs(5);

type Tail = Arc<Mutex<VecDeque<String>>>;

/// Runs command stages as isolated subprocesses.
///
/// Output is streamed to the log line by line and only the last
/// `tail_lines` lines are kept, for the failure detail. Output is never
/// interpreted.
#[derive(Debug, Clone)]
pub struct StageRunner {
    tail_lines: usize,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl StageRunner {
    /// Creates a runner keeping the default output tail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many output lines are kept.
    #[must_use]
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }

    /// Runs one stage to completion.
    ///
    /// Never returns an error: spawn failures, nonzero exits, timeouts and
    /// missing declared outputs all produce a failed [`StageResult`].
    pub async fn run(&self, spec: &StageSpec, args: &[String]) -> StageResult {
        let started_at = Utc::now();
        let timer = SpanTimer::start(&spec.name);

        debug!(stage = %spec.name, program = %spec.program, ?args, cwd = %spec.cwd.display(), "Starting stage");

        let mut child = match Command::new(&spec.program)
            .args(args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return StageResult::failed(
                    &spec.name,
                    started_at,
                    format!("failed to start '{}': {e}", spec.program),
                );
            }
        };

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.pump(stdout, "stdout", &spec.name, tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.pump(stderr, "stderr", &spec.name, tail.clone()));
        }

        let waited = match spec.timeout {
            Some(limit) => {
                let bounded = tokio::time::timeout(limit, child.wait()).await;
                if let Ok(waited) = bounded {
                    Some(waited)
                } else {
                    if let Err(e) = child.kill().await {
                        warn!(stage = %spec.name, error = %e, "Failed to kill timed out stage");
                    }
                    None
                }
            }
            None => Some(child.wait().await),
        };

        // A grandchild may keep the pipes open; do not wait on it forever.
        for pump in pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(PUMP_GRACE, pump).await.is_err() {
                abort.abort();
            }
        }
        let tail = render_tail(&tail);

        let result = match waited {
            None => StageResult::failed(
                &spec.name,
                started_at,
                with_tail(
                    format!("timed out after {}s", spec.timeout.map_or(0, |t| t.as_secs())),
                    &tail,
                ),
            ),
            Some(Err(e)) => StageResult::failed(&spec.name, started_at, format!("failed to wait: {e}")),
            Some(Ok(status)) if status.success() => {
                let missing: Vec<String> = spec
                    .produces
                    .iter()
                    .filter(|path| !path.exists())
                    .map(|path| path.display().to_string())
                    .collect();
                if missing.is_empty() {
                    StageResult::ok(&spec.name, started_at, spec.produces.clone())
                } else {
                    StageResult::failed(
                        &spec.name,
                        started_at,
                        format!("exited 0 but declared output missing: {}", missing.join(", ")),
                    )
                }
            }
            Some(Ok(status)) => {
                let code = status
                    .code()
                    .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
                StageResult::failed(&spec.name, started_at, with_tail(code, &tail))
            }
        };

        info!(
            stage = %spec.name,
            status = %result.status,
            duration_ms = timer.finish(),
            "Stage finished"
        );
        result
    }

    fn pump<R>(&self, stream: R, label: &'static str, stage: &str, tail: Tail) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stage = stage.to_string();
        let keep = self.tail_lines;
        tokio::spawn(async move {
            // Drain to EOF whatever the bytes are; a closed pipe would kill the child.
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        info!(stage = %stage, stream = label, "{line}");
                        let mut kept = tail.lock();
                        if kept.len() == keep {
                            kept.pop_front();
                        }
                        kept.push_back(line);
                    }
                    Err(e) => {
                        debug!(stage = %stage, stream = label, error = %e, "Output stream closed");
                        break;
                    }
                }
            }
        })
    }
}

fn render_tail(tail: &Tail) -> String {
    tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
}

fn with_tail(headline: String, tail: &str) -> String {
    if tail.is_empty() {
        headline
    } else {
        format!("{headline}\n{tail}")
    }
}
