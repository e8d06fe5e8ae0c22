// Shared test doubles: a scriptable agent runner and an in-memory issue host.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hydra_core::agent::{AgentIo, AgentRunner, WorkerEvent};
use hydra_core::config::Config;
use hydra_core::host::{HostError, HostIssue, HostPull, IssueHost};
use hydra_core::types::{AgentInvocation, AgentOutcome, WorkerRole};
use tokio::sync::{Mutex, Notify};

// ── Stub runner ──────────────────────────────────────────────────────────

/// One scripted agent run: emit `events`, optionally wait on `gate`, then
/// finish with `outcome`.
pub struct Script {
    pub events: Vec<WorkerEvent>,
    pub outcome: AgentOutcome,
    pub gate: Option<Arc<Notify>>,
}

impl Script {
    pub fn ok() -> Self {
        Self {
            events: Vec::new(),
            outcome: AgentOutcome::ok(),
            gate: None,
        }
    }

    pub fn done_with_pr(pr: u64) -> Self {
        let mut outcome = AgentOutcome::ok();
        outcome.pr = Some(pr);
        outcome.pr_url = Some(format!("https://host.example/pulls/{pr}"));
        outcome.branch = Some(format!("issue-{pr}"));
        Self {
            events: Vec::new(),
            outcome,
            gate: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            events: Vec::new(),
            outcome: AgentOutcome::failed("agent exited with status 1"),
            gate: None,
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            events: Vec::new(),
            outcome: AgentOutcome::ok(),
            gate: Some(gate),
        }
    }
}

/// Replays scripts per (role, issue), consuming one per spawn. Spawns with
/// no script succeed immediately. Feedback handed to a run is echoed into
/// the transcript so tests can observe correction delivery.
pub struct StubRunner {
    scripts: Mutex<HashMap<(WorkerRole, u64), VecDeque<Script>>>,
    pub invocations: Mutex<Vec<AgentInvocation>>,
}

impl StubRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub async fn script(&self, role: WorkerRole, issue: u64, script: Script) {
        self.scripts
            .lock()
            .await
            .entry((role, issue))
            .or_default()
            .push_back(script);
    }
}

#[async_trait]
impl AgentRunner for StubRunner {
    async fn run(&self, invocation: AgentInvocation, io: AgentIo) -> Result<AgentOutcome> {
        self.invocations.lock().await.push(invocation.clone());

        let script = self
            .scripts
            .lock()
            .await
            .get_mut(&(invocation.role, invocation.issue))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Script::ok);

        if let Some(feedback) = &invocation.feedback {
            let _ = io
                .events
                .send(WorkerEvent::Transcript(format!("feedback: {feedback}")));
        }
        for event in script.events {
            let _ = io.events.send(event);
        }

        if let Some(gate) = script.gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = io.cancel.cancelled() => return Ok(AgentOutcome::failed("canceled")),
            }
        }

        Ok(script.outcome)
    }
}

// ── Stub host ────────────────────────────────────────────────────────────

struct HostState {
    issues: Vec<(u64, String, bool)>, // (number, title, closed)
    merged: Vec<u64>,
    ci: HashMap<u64, Option<bool>>,
}

pub struct StubHost {
    state: Mutex<HostState>,
    next_issue: AtomicU64,
    pub fail_create: AtomicBool,
}

impl StubHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                issues: Vec::new(),
                merged: Vec::new(),
                ci: HashMap::new(),
            }),
            next_issue: AtomicU64::new(101),
            fail_create: AtomicBool::new(false),
        })
    }

    pub async fn set_ci(&self, pr: u64, verdict: Option<bool>) {
        self.state.lock().await.ci.insert(pr, verdict);
    }

    pub async fn closed_issues(&self) -> Vec<u64> {
        self.state
            .lock()
            .await
            .issues
            .iter()
            .filter(|(_, _, closed)| *closed)
            .map(|(n, _, _)| *n)
            .collect()
    }
}

#[async_trait]
impl IssueHost for StubHost {
    async fn create_issue(&self, title: &str, _body: &str, _label: &str) -> Result<HostIssue, HostError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(HostError::Permanent {
                status: 422,
                message: "validation failed".into(),
            });
        }
        let number = self.next_issue.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .await
            .issues
            .push((number, title.to_string(), false));
        Ok(HostIssue {
            number,
            title: title.to_string(),
            url: format!("https://host.example/issues/{number}"),
        })
    }

    async fn list_open_issues(&self, _label: &str) -> Result<Vec<HostIssue>, HostError> {
        Ok(self
            .state
            .lock()
            .await
            .issues
            .iter()
            .filter(|(_, _, closed)| !closed)
            .map(|(number, title, _)| HostIssue {
                number: *number,
                title: title.clone(),
                url: format!("https://host.example/issues/{number}"),
            })
            .collect())
    }

    async fn close_issue(&self, number: u64) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        match state.issues.iter_mut().find(|(n, _, _)| *n == number) {
            Some(issue) => {
                issue.2 = true;
                Ok(())
            }
            None => Err(HostError::Permanent {
                status: 404,
                message: format!("issue {number} not found"),
            }),
        }
    }

    async fn list_open_prs(&self) -> Result<Vec<HostPull>, HostError> {
        Ok(Vec::new())
    }

    async fn pr_merged(&self, pr: u64) -> Result<bool, HostError> {
        Ok(self.state.lock().await.merged.contains(&pr))
    }

    async fn ci_passing(&self, pr: u64) -> Result<Option<bool>, HostError> {
        Ok(self
            .state
            .lock()
            .await
            .ci
            .get(&pr)
            .copied()
            .unwrap_or(Some(true)))
    }

    async fn merge_pr(&self, pr: u64) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        if !state.merged.contains(&pr) {
            state.merged.push(pr);
        }
        Ok(())
    }
}

// ── Config helper ────────────────────────────────────────────────────────

pub fn test_config() -> Config {
    Config {
        issue_host_url: "http://host.example".into(),
        issue_host_token: "token".into(),
        agent_command: "/bin/false".into(),
        max_triagers: 2,
        max_planners: 2,
        max_workers: 3,
        max_reviewers: 2,
        listen_addr: "127.0.0.1:0".into(),
        data_dir: "store".into(),
        pipeline_label: "hydra".into(),
        dashboard_dist_dir: "dashboard/dist".into(),
        snapshot_interval_sec: 300,
        agent_timeout_s: 60,
    }
}

/// Wait for `predicate` against a growing event list, failing after `secs`.
pub async fn wait_for<F>(
    rx: &mut tokio::sync::mpsc::Receiver<Arc<hydra_core::event::Event>>,
    seen: &mut Vec<Arc<hydra_core::event::Event>>,
    secs: u64,
    mut predicate: F,
) -> bool
where
    F: FnMut(&[Arc<hydra_core::event::Event>]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if predicate(seen) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => seen.push(event),
            Ok(None) | Err(_) => return predicate(seen),
        }
    }
}
