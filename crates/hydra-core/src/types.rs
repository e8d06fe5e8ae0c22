use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Pipeline stages ──────────────────────────────────────────────────────

/// A pipeline stage. Every issue lives in exactly one stage bucket at a time;
/// `Merged` is terminal and `Hitl` is the human-in-the-loop sibling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Triage,
    Plan,
    Implement,
    Review,
    Merged,
    Hitl,
}

impl Stage {
    /// The four working stages, in pipeline order.
    pub const PIPELINE: [Stage; 4] = [Stage::Triage, Stage::Plan, Stage::Implement, Stage::Review];

    /// All stage buckets, working stages first.
    pub const ALL: [Stage; 6] = [
        Stage::Triage,
        Stage::Plan,
        Stage::Implement,
        Stage::Review,
        Stage::Merged,
        Stage::Hitl,
    ];

    /// The stage a `done` worker hands its issue to. `Review` hands off to the
    /// merge watcher, not to a stage, so it has no successor here.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Triage => Some(Stage::Plan),
            Stage::Plan => Some(Stage::Implement),
            Stage::Implement => Some(Stage::Review),
            Stage::Review | Stage::Merged | Stage::Hitl => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Triage => "triage",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Merged => "merged",
            Stage::Hitl => "hitl",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "triage" => Some(Stage::Triage),
            "plan" => Some(Stage::Plan),
            "implement" => Some(Stage::Implement),
            "review" => Some(Stage::Review),
            "merged" => Some(Stage::Merged),
            "hitl" => Some(Stage::Hitl),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an issue within its stage bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Queued,
    Active,
    Done,
    Failed,
    Hitl,
}

/// An issue snapshot as held in the pipeline store. The containing bucket is
/// the issue's stage; snapshots are replaced wholesale on transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub status: IssueStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Set when the issue was escalated to HITL (e.g. "from implement").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default)]
    pub memory_suggestion: bool,
}

impl Issue {
    pub fn new(number: u64, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            url: url.into(),
            status: IssueStatus::Queued,
            pr: None,
            pr_url: None,
            branch: None,
            cause: None,
            memory_suggestion: false,
        }
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

/// Which stage agent a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Triage,
    Plan,
    Implement,
    Review,
}

impl WorkerRole {
    pub fn stage(self) -> Stage {
        match self {
            WorkerRole::Triage => Stage::Triage,
            WorkerRole::Plan => Stage::Plan,
            WorkerRole::Implement => Stage::Implement,
            WorkerRole::Review => Stage::Review,
        }
    }

    pub fn for_stage(stage: Stage) -> Option<WorkerRole> {
        match stage {
            Stage::Triage => Some(WorkerRole::Triage),
            Stage::Plan => Some(WorkerRole::Plan),
            Stage::Implement => Some(WorkerRole::Implement),
            Stage::Review => Some(WorkerRole::Review),
            Stage::Merged | Stage::Hitl => None,
        }
    }

    /// Stable worker key: `triage-<issue>`, `plan-<issue>`, `<issue>` for
    /// implementers, `review-<pr>` for reviewers.
    pub fn key(self, issue: u64, pr: Option<u64>) -> String {
        match self {
            WorkerRole::Triage => format!("triage-{issue}"),
            WorkerRole::Plan => format!("plan-{issue}"),
            WorkerRole::Implement => format!("{issue}"),
            WorkerRole::Review => format!("review-{}", pr.unwrap_or(issue)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Triage => "triage",
            WorkerRole::Plan => "plan",
            WorkerRole::Implement => "implement",
            WorkerRole::Review => "review",
        }
    }
}

/// Worker lifecycle status. Transitions are monotonic through the running
/// sub-states and terminate in exactly one of done/failed/escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Queued,
    Running,
    Planning,
    Testing,
    Committing,
    Reviewing,
    QualityFix,
    Done,
    Failed,
    Escalated,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Done | WorkerStatus::Failed | WorkerStatus::Escalated)
    }

    /// Parse a `::hydra:status` marker value. Unknown values are ignored by
    /// callers (the agent contract allows forward-compatible markers).
    pub fn parse(s: &str) -> Option<WorkerStatus> {
        match s {
            "queued" => Some(WorkerStatus::Queued),
            "running" => Some(WorkerStatus::Running),
            "planning" => Some(WorkerStatus::Planning),
            "testing" => Some(WorkerStatus::Testing),
            "committing" => Some(WorkerStatus::Committing),
            "reviewing" => Some(WorkerStatus::Reviewing),
            "quality_fix" => Some(WorkerStatus::QualityFix),
            "done" => Some(WorkerStatus::Done),
            "failed" => Some(WorkerStatus::Failed),
            "escalated" => Some(WorkerStatus::Escalated),
            _ => None,
        }
    }
}

/// Number of transcript lines retained per worker.
pub const TRANSCRIPT_CAPACITY: usize = 2_000;

/// An active or recently completed agent sub-process. Records are kept after
/// completion for inspection until the next session reset.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub key: String,
    pub role: WorkerRole,
    pub issue: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub status: WorkerStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub transcript: VecDeque<String>,
}

impl WorkerRecord {
    pub fn new(key: String, role: WorkerRole, issue: u64, pr: Option<u64>) -> Self {
        Self {
            key,
            role,
            issue,
            pr,
            status: WorkerStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            transcript: VecDeque::new(),
        }
    }

    pub fn push_transcript(&mut self, line: String) {
        self.transcript.push_back(line);
        if self.transcript.len() > TRANSCRIPT_CAPACITY {
            self.transcript.pop_front();
        }
    }
}

// ── Pull requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub pr: u64,
    pub issue: u64,
    pub branch: String,
    pub url: String,
    pub draft: bool,
    pub merged: bool,
}

// ── HITL ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlStatus {
    Pending,
    Processing,
    Resolved,
    /// Memory-suggestion variant awaiting explicit approval.
    Approval,
}

/// Derived view of an issue detained in the HITL stage.
#[derive(Debug, Clone, Serialize)]
pub struct HitlItem {
    pub issue: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub status: HitlStatus,
    /// Free-form reason, "from <stage>" for automatic escalations.
    pub cause: String,
    pub is_memory_suggestion: bool,
}

// ── Agent seam types ─────────────────────────────────────────────────────

/// Input handed to an agent sub-process (JSON on stdin).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub role: WorkerRole,
    #[serde(rename = "issue_number")]
    pub issue: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// HITL correction or question answer carried into the next run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Terminal verdict of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVerdict {
    Ok,
    Failed,
    Escalated,
    /// Agent runtime refused to run for billing reasons.
    Credits,
}

/// Everything the pool learns from a finished agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub verdict: AgentVerdict,
    pub pr: Option<u64>,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub cause: Option<String>,
    /// Escalation is a memory suggestion needing explicit approval.
    pub memory_suggestion: bool,
}

impl AgentOutcome {
    pub fn ok() -> Self {
        Self {
            verdict: AgentVerdict::Ok,
            pr: None,
            pr_url: None,
            branch: None,
            cause: None,
            memory_suggestion: false,
        }
    }

    pub fn failed(cause: impl Into<String>) -> Self {
        Self {
            verdict: AgentVerdict::Failed,
            pr: None,
            pr_url: None,
            branch: None,
            cause: Some(cause.into()),
            memory_suggestion: false,
        }
    }
}
