use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{AgentInvocation, AgentOutcome, WorkerStatus};

/// One parsed unit of agent output, as consumed by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A recognized `::hydra:status` marker.
    Status(WorkerStatus),
    /// A `::hydra:question` marker: the agent is blocked on a human answer.
    Question(String),
    /// Any other output line; appended to the worker transcript.
    Transcript(String),
}

/// Channels wiring one agent run to its supervising worker task.
pub struct AgentIo {
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Human answers forwarded to the agent's stdin, one line each.
    pub answers: mpsc::UnboundedReceiver<String>,
    pub cancel: CancellationToken,
}

/// The seam between the pool and whatever actually runs agents. Production
/// uses the `AGENT_COMMAND` sub-process runner; tests script this directly.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one agent to completion, streaming output through `io`. Errors are
    /// infrastructure failures (could not spawn); agent-level failure is an
    /// outcome, not an error.
    async fn run(&self, invocation: AgentInvocation, io: AgentIo) -> Result<AgentOutcome>;
}
