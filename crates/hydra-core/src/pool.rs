use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentIo, AgentRunner, WorkerEvent};
use crate::bus::EventBus;
use crate::event::EventKind;
use crate::types::{
    AgentInvocation, AgentOutcome, AgentVerdict, Issue, WorkerRecord, WorkerRole, WorkerStatus,
};

/// How long `cancel_all` waits for workers to wind down before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Terminal result of one worker, routed to the scheduler.
#[derive(Debug, Clone)]
pub struct PoolOutcome {
    pub key: String,
    pub role: WorkerRole,
    pub issue: u64,
    pub outcome: AgentOutcome,
    /// True when the worker passed through the quality_fix sub-state.
    pub quality_fix: bool,
}

struct RunningWorker {
    issue: u64,
    cancel: CancellationToken,
    answer_tx: mpsc::UnboundedSender<String>,
}

/// Supervises agent sub-processes: spawns them through the `AgentRunner`
/// seam, translates their output into worker records, transcript events, and
/// questions, and reports terminal outcomes to the scheduler.
///
/// Records outlive their runs and are kept for inspection until session
/// reset; only the pool mutates them.
pub struct WorkerPool {
    bus: Arc<EventBus>,
    runner: Arc<dyn AgentRunner>,
    records: Mutex<HashMap<String, WorkerRecord>>,
    running: Mutex<HashMap<String, RunningWorker>>,
    outcome_tx: mpsc::UnboundedSender<PoolOutcome>,
    question_tx: mpsc::UnboundedSender<(u64, String)>,
    /// HITL feedback waiting to ride along on the next spawn per issue.
    feedback: Mutex<HashMap<u64, String>>,
}

impl WorkerPool {
    pub fn new(
        bus: Arc<EventBus>,
        runner: Arc<dyn AgentRunner>,
        outcome_tx: mpsc::UnboundedSender<PoolOutcome>,
        question_tx: mpsc::UnboundedSender<(u64, String)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            runner,
            records: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            outcome_tx,
            question_tx,
            feedback: Mutex::new(HashMap::new()),
        })
    }

    /// The event kind carrying a worker status for its stage.
    fn update_event(role: WorkerRole, issue: u64, pr: Option<u64>, status: WorkerStatus, key: &str) -> EventKind {
        let worker = key.to_string();
        match role {
            WorkerRole::Triage => EventKind::TriageUpdate { issue, status, worker },
            WorkerRole::Plan => EventKind::PlannerUpdate { issue, status, worker },
            WorkerRole::Implement => EventKind::WorkerUpdate { issue, status, worker },
            WorkerRole::Review => EventKind::ReviewUpdate {
                pr: pr.unwrap_or(0),
                issue,
                status,
                worker,
            },
        }
    }

    /// Start an agent for `issue` in `role`. The scheduler is responsible for
    /// cap accounting; the pool only supervises.
    pub async fn spawn(self: &Arc<Self>, role: WorkerRole, issue: &Issue) -> String {
        let key = role.key(issue.number, issue.pr);
        let feedback = self.feedback.lock().await.remove(&issue.number);
        let invocation = AgentInvocation {
            role,
            issue: issue.number,
            pr: issue.pr,
            branch: issue.branch.clone(),
            feedback,
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let record = WorkerRecord::new(key.clone(), role, issue.number, issue.pr);
        self.records.lock().await.insert(key.clone(), record);
        self.running.lock().await.insert(
            key.clone(),
            RunningWorker {
                issue: issue.number,
                cancel: cancel.clone(),
                answer_tx,
            },
        );

        self.bus
            .publish(Self::update_event(role, issue.number, issue.pr, WorkerStatus::Running, &key))
            .await;

        info!(worker = %key, role = %role.as_str(), issue = issue.number, "spawning worker");

        let pool = Arc::clone(self);
        let pr = issue.pr;
        let issue_number = issue.number;
        let task_key = key.clone();
        tokio::spawn(async move {
            let key = task_key;
            let io = AgentIo {
                events: event_tx,
                answers: answer_rx,
                cancel: cancel.clone(),
            };
            let consumer = tokio::spawn(Arc::clone(&pool).consume_events(
                key.clone(),
                role,
                issue_number,
                pr,
                event_rx,
            ));

            let result = pool.runner.run(invocation, io).await;
            let quality_fix = consumer.await.unwrap_or(false);

            let outcome = match result {
                Ok(o) => o,
                Err(e) => {
                    error!(worker = %key, "agent runner failed: {e:#}");
                    AgentOutcome::failed(format!("agent runner failed: {e}"))
                }
            };

            pool.finish(key, role, issue_number, pr, outcome, quality_fix).await;
        });

        key
    }

    /// Drain one worker's event stream until the runner drops its sender.
    /// Returns whether the quality_fix sub-state was observed.
    async fn consume_events(
        self: Arc<Self>,
        key: String,
        role: WorkerRole,
        issue: u64,
        pr: Option<u64>,
        mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> bool {
        let mut quality_fix = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                WorkerEvent::Status(status) => {
                    // Terminal state is decided by the result line, not markers.
                    if status.is_terminal() {
                        continue;
                    }
                    if status == WorkerStatus::QualityFix {
                        quality_fix = true;
                    }
                    if let Some(record) = self.records.lock().await.get_mut(&key) {
                        record.status = status;
                    }
                    self.bus
                        .publish(Self::update_event(role, issue, pr, status, &key))
                        .await;
                }
                WorkerEvent::Question(text) => {
                    info!(worker = %key, issue, "worker raised a question");
                    let _ = self.question_tx.send((issue, text));
                }
                WorkerEvent::Transcript(line) => {
                    if let Some(record) = self.records.lock().await.get_mut(&key) {
                        record.push_transcript(line.clone());
                    }
                    self.bus
                        .publish(EventKind::TranscriptLine {
                            issue: Some(issue),
                            pr,
                            source: role.as_str().to_string(),
                            line,
                        })
                        .await;
                }
            }
        }
        quality_fix
    }

    /// Record the terminal state, emit the closing events, and hand the
    /// outcome to the scheduler.
    async fn finish(
        &self,
        key: String,
        role: WorkerRole,
        issue: u64,
        pr: Option<u64>,
        outcome: AgentOutcome,
        quality_fix: bool,
    ) {
        // pr_created precedes the terminal worker update so consumers always
        // know the PR before they see the implementer finish.
        if role == WorkerRole::Implement && outcome.verdict == AgentVerdict::Ok {
            if let Some(new_pr) = outcome.pr {
                self.bus
                    .publish(EventKind::PrCreated {
                        pr: new_pr,
                        issue,
                        url: outcome.pr_url.clone().unwrap_or_default(),
                        draft: false,
                    })
                    .await;
            }
        }

        let terminal = match outcome.verdict {
            AgentVerdict::Ok => WorkerStatus::Done,
            AgentVerdict::Escalated => WorkerStatus::Escalated,
            AgentVerdict::Failed | AgentVerdict::Credits => WorkerStatus::Failed,
        };

        if let Some(record) = self.records.lock().await.get_mut(&key) {
            record.status = terminal;
            record.end_time = Some(Utc::now());
            if record.pr.is_none() {
                record.pr = outcome.pr;
            }
        }
        self.running.lock().await.remove(&key);

        self.bus
            .publish(Self::update_event(role, issue, pr.or(outcome.pr), terminal, &key))
            .await;

        let sent = self.outcome_tx.send(PoolOutcome {
            key: key.clone(),
            role,
            issue,
            outcome,
            quality_fix,
        });
        if sent.is_err() {
            warn!(worker = %key, "scheduler gone, outcome dropped");
        }
    }

    /// Stash feedback to be injected into the next worker spawned for `issue`.
    pub async fn set_feedback(&self, issue: u64, feedback: impl Into<String>) {
        self.feedback.lock().await.insert(issue, feedback.into());
    }

    /// Answer an in-flight worker's question. Returns false when no worker
    /// for the issue is currently running.
    pub async fn answer(&self, issue: u64, answer: &str) -> bool {
        let running = self.running.lock().await;
        for worker in running.values() {
            if worker.issue == issue {
                return worker.answer_tx.send(answer.to_string()).is_ok();
            }
        }
        false
    }

    /// Request graceful termination of one worker.
    pub async fn cancel(&self, key: &str) -> bool {
        match self.running.lock().await.get(key) {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running worker and wait for the pool to drain.
    pub async fn cancel_all(&self) {
        {
            let running = self.running.lock().await;
            for worker in running.values() {
                worker.cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            if self.running.lock().await.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("worker pool did not drain within {DRAIN_TIMEOUT:?}");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn worker(&self, key: &str) -> Option<WorkerRecord> {
        self.records.lock().await.get(key).cloned()
    }

    /// Session reset: drop completed worker records. Running workers (if any)
    /// keep their records so their terminal updates still have a home.
    pub async fn reset(&self) {
        let running = self.running.lock().await;
        self.records
            .lock()
            .await
            .retain(|key, _| running.contains_key(key));
    }
}
