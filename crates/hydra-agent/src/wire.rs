use hydra_core::types::{AgentOutcome, AgentVerdict, WorkerStatus};
use serde::Deserialize;

/// Marker prefix for sub-state updates: `::hydra:status testing`.
pub const STATUS_MARKER: &str = "::hydra:status ";
/// Marker prefix for human questions: `::hydra:question Which table?`.
pub const QUESTION_MARKER: &str = "::hydra:question ";
/// Marker prefix for the terminal line: `::hydra:result {"verdict":"ok"}`.
pub const RESULT_MARKER: &str = "::hydra:result ";

/// The terminal `::hydra:result` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResult {
    pub verdict: String,
    #[serde(default)]
    pub pr: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub memory_suggestion: bool,
}

/// One classified line of agent stdout.
#[derive(Debug, Clone)]
pub enum Line {
    Status(WorkerStatus),
    Question(String),
    /// Parsed terminal line; schema violations collapse to a failed outcome
    /// (same policy as an agent crash).
    Result(AgentOutcome),
    /// Anything else is transcript.
    Text(String),
}

pub fn parse_line(line: &str) -> Line {
    if let Some(value) = line.strip_prefix(STATUS_MARKER) {
        match WorkerStatus::parse(value.trim()) {
            Some(status) => return Line::Status(status),
            // Unknown status markers pass through as transcript.
            None => return Line::Text(line.to_string()),
        }
    }
    if let Some(question) = line.strip_prefix(QUESTION_MARKER) {
        return Line::Question(question.trim().to_string());
    }
    if let Some(json) = line.strip_prefix(RESULT_MARKER) {
        return Line::Result(parse_result(json));
    }
    Line::Text(line.to_string())
}

/// Parse the result JSON. Invalid payloads are a schema violation and yield
/// a failed outcome carrying the parse error.
pub fn parse_result(json: &str) -> AgentOutcome {
    let result: AgentResult = match serde_json::from_str(json.trim()) {
        Ok(r) => r,
        Err(e) => return AgentOutcome::failed(format!("invalid result payload: {e}")),
    };

    let verdict = match result.verdict.as_str() {
        "ok" | "success" | "done" => AgentVerdict::Ok,
        "failed" => AgentVerdict::Failed,
        "escalated" => AgentVerdict::Escalated,
        "credits" | "credits_exhausted" => AgentVerdict::Credits,
        other => {
            return AgentOutcome::failed(format!("unknown verdict {other:?}"));
        }
    };

    AgentOutcome {
        verdict,
        pr: result.pr,
        pr_url: result.pr_url,
        branch: result.branch,
        cause: result.cause,
        memory_suggestion: result.memory_suggestion,
    }
}
