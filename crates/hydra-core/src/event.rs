use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::loops::LoopStatus;
use crate::metrics::MetricsSnapshot;
use crate::types::{IssueStatus, Stage, WorkerStatus};

/// Global orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
    /// All queues drained with no active workers; admission continues.
    Done,
    /// Agent runtime refused to run for billing reasons; admission paused
    /// until an explicit start command.
    CreditsPaused,
    AuthFailed,
}

/// Queue depth for one stage, as carried by `queue_update`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageDepth {
    pub queued: usize,
    pub active: usize,
}

/// Every event kind the bus can carry. Serialized as `{"type": ..., "data": ...}`
/// so the in-process variant and the wire form stay one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    OrchestratorStatus {
        status: OrchestratorStatus,
        #[serde(default)]
        reset: bool,
    },
    PhaseChange {
        phase: Stage,
    },
    BatchStart {
        batch: u64,
        queued: usize,
    },
    BatchComplete {
        batch: u64,
        admitted: usize,
    },
    TriageUpdate {
        issue: u64,
        status: WorkerStatus,
        worker: String,
    },
    PlannerUpdate {
        issue: u64,
        status: WorkerStatus,
        worker: String,
    },
    WorkerUpdate {
        issue: u64,
        status: WorkerStatus,
        worker: String,
    },
    ReviewUpdate {
        pr: u64,
        issue: u64,
        status: WorkerStatus,
        worker: String,
    },
    TranscriptLine {
        #[serde(skip_serializing_if = "Option::is_none")]
        issue: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr: Option<u64>,
        source: String,
        line: String,
    },
    PrCreated {
        pr: u64,
        issue: u64,
        url: String,
        draft: bool,
    },
    MergeUpdate {
        pr: u64,
        status: String,
    },
    HitlEscalation {
        issue: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr: Option<u64>,
        cause: String,
    },
    HitlUpdate {
        issue: u64,
        action: String,
        status: String,
    },
    PipelineUpdate {
        issue: u64,
        stage: Stage,
        status: IssueStatus,
    },
    QueueUpdate {
        depths: HashMap<Stage, StageDepth>,
    },
    BackgroundWorkerStatus {
        name: String,
        status: LoopStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_run: Option<DateTime<Utc>>,
        detail: String,
    },
    MetricsUpdate {
        snapshot: MetricsSnapshot,
    },
    SystemAlert {
        message: String,
    },
    Error {
        kind: String,
        message: String,
    },
    IntentCreated {
        issue: u64,
        text: String,
    },
    IntentFailed {
        message: String,
    },
    /// Synthetic sentinel sent to a subscriber whose `since` id has fallen
    /// behind the retention ring. Never appended to the log.
    Gap {
        missed_before: u64,
    },
}

/// One immutable record in the bus's append-only log. The wire shape is
/// `{type, data, timestamp, id}` via the flattened kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}
