//! Bash command step executor

use crate::workflow::executor::{StepContext, StepExecutor, StepFailure, StepResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Environment variable holding the run data as JSON
pub const ENV_DATA: &str = "STEPRAIL_DATA";
/// Environment variable holding the step name
pub const ENV_STEP: &str = "STEPRAIL_STEP";
/// Environment variable holding the 1-based attempt number
pub const ENV_ATTEMPT: &str = "STEPRAIL_ATTEMPT";

/// Runs a shell command with `bash -c`
///
/// The exit code, stdout and stderr are written under the step's scope of
/// the run data (`<step>.exit_code`, `<step>.stdout`, `<step>.stderr`). A
/// non-zero exit fails the step; cancellation kills the child process.
#[derive(Debug, Clone)]
pub struct BashStep {
    command: String,
}

impl BashStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// How long output readers may lag behind the process exit
///
/// A background job started by the command can keep the pipes open long
/// after `bash` itself is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines read from one child stream, kept even when the reader is aborted
struct OutputCollector {
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl OutputCollector {
    fn spawn<R>(stream: R, step: String, label: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(step = step.as_str(), stream = label, "{}", line);
                sink.lock().unwrap_or_else(PoisonError::into_inner).push(line);
            }
        });
        Self { lines, task }
    }

    async fn finish(self, step: &str, label: &'static str) -> String {
        let mut task = self.task;
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
            task.abort();
            tracing::warn!(
                step,
                stream = label,
                "Output still open after the command exited; keeping what was read"
            );
        }
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.join("\n")
    }
}

#[async_trait]
impl StepExecutor for BashStep {
    async fn execute(&self, ctx: StepContext) -> StepResult {
        let start_time = Instant::now();
        let data = serde_json::to_string(&ctx.cursor().to_value())
            .map_err(|e| StepFailure::failed(format!("Failed to serialize run data: {}", e)))?;

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env(ENV_DATA, data)
            .env(ENV_STEP, ctx.step_name())
            .env(ENV_ATTEMPT, ctx.attempt().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepFailure::failed(format!("Failed to spawn bash process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepFailure::failed("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StepFailure::failed("Failed to capture stderr"))?;
        let stdout_reader = OutputCollector::spawn(stdout, ctx.step_name().to_string(), "stdout");
        let stderr_reader = OutputCollector::spawn(stderr, ctx.step_name().to_string(), "stderr");

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| StepFailure::failed(format!("Failed to wait for process: {}", e)))?,
            _ = ctx.signal().cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(step = ctx.step_name(), error = %e, "Failed to kill cancelled command");
                }
                return Err(StepFailure::Cancelled);
            }
        };

        let (stdout, stderr) = tokio::join!(
            stdout_reader.finish(ctx.step_name(), "stdout"),
            stderr_reader.finish(ctx.step_name(), "stderr"),
        );

        let scoped = ctx.scoped();
        scoped.set("exit_code", status.code());
        scoped.set("stdout", stdout);
        scoped.set("stderr", stderr);

        tracing::debug!(
            step = ctx.step_name(),
            exit_code = ?status.code(),
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Command finished"
        );

        if status.success() {
            Ok(())
        } else {
            Err(StepFailure::failed(format!(
                "Command failed with exit code {:?}",
                status.code()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::cursor::DataCursor;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn context(step: &str, cursor: DataCursor, signal: CancellationToken) -> StepContext {
        StepContext::new(step, 0, 1, cursor, Arc::from(Vec::new()), signal)
    }

    #[tokio::test]
    async fn test_bash_step_success() {
        let cursor = DataCursor::new();
        let step = BashStep::new("echo hello && echo \"$STEPRAIL_STEP\"");

        step.execute(context("greet", cursor.clone(), CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(cursor.get("greet.exit_code"), Some(json!(0)));
        assert_eq!(cursor.get("greet.stdout"), Some(json!("hello\ngreet")));
    }

    #[tokio::test]
    async fn test_bash_step_failure() {
        let cursor = DataCursor::new();
        let step = BashStep::new("echo oops >&2; exit 3");

        let err = step
            .execute(context("broken", cursor.clone(), CancellationToken::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, StepFailure::Failed(_)));
        assert_eq!(cursor.get("broken.exit_code"), Some(json!(3)));
        assert_eq!(cursor.get("broken.stderr"), Some(json!("oops")));
    }

    #[tokio::test]
    async fn test_bash_step_sees_run_data() {
        let cursor = DataCursor::from_value(json!({ "target": "prod" }));
        let step = BashStep::new("echo \"$STEPRAIL_DATA\"");

        step.execute(context("env", cursor.clone(), CancellationToken::new()))
            .await
            .unwrap();

        let stdout = cursor.get("env.stdout").unwrap();
        assert!(stdout.as_str().unwrap().contains("\"target\":\"prod\""));
    }

    #[tokio::test]
    async fn test_bash_step_cancellation_kills_child() {
        let signal = CancellationToken::new();
        let step = BashStep::new("sleep 10");

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = step
            .execute(context("slow", DataCursor::new(), signal))
            .await
            .unwrap_err();

        assert_eq!(err, StepFailure::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_background_job_does_not_hold_step_open() {
        let cursor = DataCursor::new();
        let step = BashStep::new("echo started; sleep 8 &");

        let started = Instant::now();
        step.execute(context("detach", cursor.clone(), CancellationToken::new()))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(cursor.get("detach.stdout"), Some(json!("started")));
        assert_eq!(cursor.get("detach.exit_code"), Some(json!(0)));
    }
}
