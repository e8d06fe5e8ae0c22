use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hydra_core::agent::{AgentIo, AgentRunner, WorkerEvent};
use hydra_core::types::{AgentInvocation, AgentOutcome};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Grace period between SIGTERM and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Runs the configured agent binary as a sub-process per worker.
///
/// The invocation is written to the agent's stdin as one JSON line; human
/// answers follow as further lines. Stdout is consumed line by line and
/// classified through the `::hydra:` marker grammar.
pub struct CommandRunner {
    pub command: String,
    /// Kill the sub-process and report failure after this long.
    pub timeout: Duration,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(1_800),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// SIGTERM, wait out the grace period, then hard-kill.
    async fn terminate(child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "agent ignored SIGTERM, killing");
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run(&self, invocation: AgentInvocation, io: AgentIo) -> Result<AgentOutcome> {
        let AgentIo { events, mut answers, cancel } = io;

        let issue = invocation.issue;
        info!(issue, role = %invocation.role.as_str(), command = %self.command, "spawning agent");

        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn agent: {}", self.command))?;

        let mut stdin = child.stdin.take().context("failed to take agent stdin")?;
        let stdout = child.stdout.take().context("failed to take agent stdout")?;
        let stderr = child.stderr.take().context("failed to take agent stderr")?;

        let payload = serde_json::to_string(&invocation).context("serialize invocation")?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .context("write invocation")?;
        stdin.write_all(b"\n").await.context("write invocation")?;

        // Forward human answers as further stdin lines for the process's
        // lifetime; the channel closes when the pool retires the worker.
        tokio::spawn(async move {
            while let Some(answer) = answers.recv().await {
                if stdin.write_all(answer.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stderr_open = true;
        let mut outcome: Option<AgentOutcome> = None;
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match crate::wire::parse_line(&line) {
                            crate::wire::Line::Status(status) => {
                                let _ = events.send(WorkerEvent::Status(status));
                            }
                            crate::wire::Line::Question(text) => {
                                let _ = events.send(WorkerEvent::Question(text));
                            }
                            crate::wire::Line::Result(result) => {
                                outcome = Some(result);
                            }
                            crate::wire::Line::Text(text) => {
                                let _ = events.send(WorkerEvent::Transcript(text));
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(issue, "error reading agent stdout: {e}");
                            break;
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) if !line.is_empty() => {
                            warn!(issue, "agent stderr: {line}");
                        }
                        Ok(Some(_)) => {}
                        _ => stderr_open = false,
                    }
                }
                _ = cancel.cancelled() => {
                    info!(issue, "cancelling agent");
                    Self::terminate(&mut child).await;
                    return Ok(AgentOutcome::failed("canceled"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(issue, timeout = ?self.timeout, "agent timed out");
                    Self::terminate(&mut child).await;
                    return Ok(AgentOutcome::failed(format!(
                        "agent timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status.context("wait for agent")?,
            Err(_) => {
                Self::terminate(&mut child).await;
                return Ok(AgentOutcome::failed(format!(
                    "agent timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        // Non-zero exit is failure no matter what the agent printed; a clean
        // exit without a result line is a schema violation.
        let outcome = if !status.success() {
            AgentOutcome::failed(format!(
                "agent exited with status {}",
                status.code().unwrap_or(-1)
            ))
        } else {
            match outcome {
                Some(o) => o,
                None => AgentOutcome::failed("agent exited without a result line"),
            }
        };

        Ok(outcome)
    }
}
