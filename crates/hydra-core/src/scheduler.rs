use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::event::{EventKind, OrchestratorStatus};
use crate::hitl::HitlCoordinator;
use crate::metrics::Metrics;
use crate::pool::{PoolOutcome, WorkerPool};
use crate::store::PipelineStore;
use crate::types::{AgentVerdict, IssueStatus, PullRequest, Stage, WorkerRole};

/// Admission re-runs at this cadence on top of event-driven wakeups.
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum SchedulerCommand {
    Start,
    Stop,
    SetStageEnabled { stage: Stage, enabled: bool },
    /// Place an issue into a stage's queue (HITL resolution, request-changes).
    Enqueue { issue: u64, stage: Stage },
    Query { reply: oneshot::Sender<SchedulerView> },
}

/// Read-only view of scheduler state for `/api/control/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerView {
    pub status: OrchestratorStatus,
    pub enabled: HashMap<Stage, bool>,
    pub active: HashMap<Stage, usize>,
    pub batch: u64,
}

/// Cheap cloneable front door to the scheduler loop. Commands are accepted
/// immediately; results surface as events.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn new(tx: mpsc::UnboundedSender<SchedulerCommand>) -> Self {
        Self { tx }
    }

    pub fn start(&self) {
        let _ = self.tx.send(SchedulerCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SchedulerCommand::Stop);
    }

    pub fn set_stage_enabled(&self, stage: Stage, enabled: bool) {
        let _ = self.tx.send(SchedulerCommand::SetStageEnabled { stage, enabled });
    }

    pub fn enqueue(&self, issue: u64, stage: Stage) {
        let _ = self.tx.send(SchedulerCommand::Enqueue { issue, stage });
    }

    pub async fn view(&self) -> Option<SchedulerView> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SchedulerCommand::Query { reply }).ok()?;
        rx.await.ok()
    }
}

/// Moves issues between stages subject to per-stage caps and enable flags.
///
/// The loop is single-threaded over its own state: admission decisions,
/// completion routing, and control commands all pass through here, so cap
/// and FIFO invariants hold without further locking.
pub struct Scheduler {
    bus: Arc<EventBus>,
    store: Arc<PipelineStore>,
    pool: Arc<WorkerPool>,
    hitl: Arc<HitlCoordinator>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,

    cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    outcome_rx: mpsc::UnboundedReceiver<PoolOutcome>,

    status: OrchestratorStatus,
    enabled: HashMap<Stage, bool>,
    active: HashMap<Stage, HashSet<u64>>,
    batch: u64,
    phase: Option<Stage>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<PipelineStore>,
        pool: Arc<WorkerPool>,
        hitl: Arc<HitlCoordinator>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
        cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
        outcome_rx: mpsc::UnboundedReceiver<PoolOutcome>,
    ) -> Self {
        let enabled = Stage::PIPELINE.iter().map(|s| (*s, true)).collect();
        Self {
            bus,
            store,
            pool,
            hitl,
            metrics,
            config,
            cmd_rx,
            outcome_rx,
            status: OrchestratorStatus::Idle,
            enabled,
            active: HashMap::new(),
            batch: 0,
            phase: None,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.admit().await;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                outcome = self.outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_outcome(outcome).await;
                        self.admit().await;
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    async fn set_status(&mut self, status: OrchestratorStatus, reset: bool) {
        if self.status == status && !reset {
            return;
        }
        self.status = status;
        self.bus
            .publish(EventKind::OrchestratorStatus { status, reset })
            .await;
    }

    fn is_admitting(&self) -> bool {
        matches!(self.status, OrchestratorStatus::Running | OrchestratorStatus::Done)
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Start => {
                match self.status {
                    OrchestratorStatus::Idle
                    | OrchestratorStatus::Stopped
                    | OrchestratorStatus::AuthFailed => {
                        // Fresh session: live worker records and session
                        // counters go, lifetime counters and history stay.
                        self.pool.reset().await;
                        self.metrics.reset_session().await;
                        self.set_status(OrchestratorStatus::Running, true).await;
                    }
                    OrchestratorStatus::CreditsPaused | OrchestratorStatus::Done => {
                        self.set_status(OrchestratorStatus::Running, false).await;
                    }
                    OrchestratorStatus::Running | OrchestratorStatus::Stopping => {}
                }
                self.admit().await;
            }
            SchedulerCommand::Stop => {
                if matches!(self.status, OrchestratorStatus::Idle | OrchestratorStatus::Stopping) {
                    return;
                }
                self.set_status(OrchestratorStatus::Stopping, false).await;
                self.pool.cancel_all().await;
                // Outcomes from cancelled workers requeue rather than escalate.
                while let Ok(outcome) = self.outcome_rx.try_recv() {
                    self.store.set_status(outcome.issue, IssueStatus::Queued).await;
                }
                for set in self.active.values_mut() {
                    set.clear();
                }
                self.set_status(OrchestratorStatus::Idle, false).await;
            }
            SchedulerCommand::SetStageEnabled { stage, enabled } => {
                if self.enabled.insert(stage, enabled).is_some() {
                    info!(stage = %stage, enabled, "stage admission toggled");
                }
                let depths = self.store.queue_depths().await;
                self.bus.publish(EventKind::QueueUpdate { depths }).await;
                if enabled {
                    self.admit().await;
                }
            }
            SchedulerCommand::Enqueue { issue, stage } => {
                self.store
                    .move_issue(issue, None, stage, IssueStatus::Queued)
                    .await;
                self.admit().await;
            }
            SchedulerCommand::Query { reply } => {
                let view = SchedulerView {
                    status: self.status,
                    enabled: self.enabled.clone(),
                    active: self
                        .active
                        .iter()
                        .map(|(stage, set)| (*stage, set.len()))
                        .collect(),
                    batch: self.batch,
                };
                let _ = reply.send(view);
            }
        }
    }

    /// One admission cycle: fill every enabled stage up to its cap, FIFO.
    async fn admit(&mut self) {
        if !self.is_admitting() {
            return;
        }

        let snapshot = self.store.snapshot().await;
        let total_queued: usize = Stage::PIPELINE
            .iter()
            .filter_map(|s| snapshot.get(s))
            .map(|b| b.iter().filter(|i| i.status == IssueStatus::Queued).count())
            .sum();

        let mut admitted = 0usize;
        let mut batch_started = false;

        for stage in Stage::PIPELINE {
            if !self.enabled.get(&stage).copied().unwrap_or(true) {
                continue;
            }
            let Some(role) = WorkerRole::for_stage(stage) else { continue };
            let cap = self.config.cap(stage);
            let Some(bucket) = snapshot.get(&stage) else { continue };

            for issue in bucket.iter().filter(|i| i.status == IssueStatus::Queued) {
                let running = self.active.get(&stage).map_or(0, HashSet::len);
                if running >= cap {
                    break;
                }
                if self.active.get(&stage).is_some_and(|s| s.contains(&issue.number)) {
                    continue;
                }
                // Reviewers need the PR the implementer opened.
                if stage == Stage::Review && issue.pr.is_none() {
                    warn!(issue = issue.number, "review queued without a PR, holding");
                    continue;
                }

                if !batch_started {
                    self.batch += 1;
                    batch_started = true;
                    self.bus
                        .publish(EventKind::BatchStart { batch: self.batch, queued: total_queued })
                        .await;
                }

                self.store.set_status(issue.number, IssueStatus::Active).await;
                self.active.entry(stage).or_default().insert(issue.number);
                if stage == Stage::Triage {
                    self.metrics.record(|c| c.issues_admitted += 1).await;
                }
                self.pool.spawn(role, issue).await;
                admitted += 1;
            }
        }

        if batch_started {
            self.bus
                .publish(EventKind::BatchComplete { batch: self.batch, admitted })
                .await;
        }

        self.update_phase().await;
        self.update_done_state().await;
    }

    /// Publish `phase_change` when the stage with the most active workers flips.
    async fn update_phase(&mut self) {
        let dominant = Stage::PIPELINE
            .iter()
            .map(|s| (*s, self.active.get(s).map_or(0, HashSet::len)))
            .filter(|(_, n)| *n > 0)
            .max_by_key(|(_, n)| *n)
            .map(|(s, _)| s);
        if let Some(stage) = dominant {
            if self.phase != Some(stage) {
                self.phase = Some(stage);
                self.bus.publish(EventKind::PhaseChange { phase: stage }).await;
            }
        }
    }

    /// Flip running↔done as the pipeline drains and refills.
    async fn update_done_state(&mut self) {
        let active: usize = self.active.values().map(HashSet::len).sum();
        let snapshot = self.store.snapshot().await;
        let queued: usize = Stage::PIPELINE
            .iter()
            .filter_map(|s| snapshot.get(s))
            .map(|b| {
                b.iter()
                    .filter(|i| matches!(i.status, IssueStatus::Queued | IssueStatus::Active))
                    .count()
            })
            .sum();

        match self.status {
            OrchestratorStatus::Running if active == 0 && queued == 0 => {
                self.set_status(OrchestratorStatus::Done, false).await;
            }
            OrchestratorStatus::Done if active > 0 || queued > 0 => {
                self.set_status(OrchestratorStatus::Running, false).await;
            }
            _ => {}
        }
    }

    async fn handle_outcome(&mut self, out: PoolOutcome) {
        let stage = out.role.stage();
        if let Some(set) = self.active.get_mut(&stage) {
            set.remove(&out.issue);
        }

        if !self.is_admitting() && self.status != OrchestratorStatus::CreditsPaused {
            // Cancelled during stop: requeue for the next session.
            self.store.set_status(out.issue, IssueStatus::Queued).await;
            return;
        }

        if out.quality_fix {
            self.metrics.record(|c| c.quality_fixes += 1).await;
        }

        match out.outcome.verdict {
            AgentVerdict::Ok => self.route_done(out).await,
            AgentVerdict::Failed => {
                self.hitl
                    .escalate(out.issue, format!("from {stage}"), out.outcome.pr, false)
                    .await;
            }
            AgentVerdict::Escalated => {
                let cause = out
                    .outcome
                    .cause
                    .clone()
                    .unwrap_or_else(|| format!("from {stage}"));
                self.hitl
                    .escalate(out.issue, cause, out.outcome.pr, out.outcome.memory_suggestion)
                    .await;
            }
            AgentVerdict::Credits => {
                warn!(issue = out.issue, "agent runtime out of credits, pausing admission");
                self.store.set_status(out.issue, IssueStatus::Queued).await;
                self.set_status(OrchestratorStatus::CreditsPaused, false).await;
            }
        }
    }

    /// Route a successful worker to the next stage.
    async fn route_done(&mut self, out: PoolOutcome) {
        match out.role {
            WorkerRole::Triage => {
                self.store
                    .move_issue(out.issue, Some(Stage::Triage), Stage::Plan, IssueStatus::Queued)
                    .await;
            }
            WorkerRole::Plan => {
                self.store
                    .move_issue(out.issue, Some(Stage::Plan), Stage::Implement, IssueStatus::Queued)
                    .await;
            }
            WorkerRole::Implement => {
                self.metrics.record(|c| c.implementations += 1).await;
                match out.outcome.pr {
                    Some(pr) => {
                        self.store
                            .record_pr(PullRequest {
                                pr,
                                issue: out.issue,
                                branch: out.outcome.branch.clone().unwrap_or_default(),
                                url: out.outcome.pr_url.clone().unwrap_or_default(),
                                draft: false,
                                merged: false,
                            })
                            .await;
                        self.metrics.record(|c| c.prs_opened += 1).await;
                        self.store
                            .move_issue(out.issue, Some(Stage::Implement), Stage::Review, IssueStatus::Queued)
                            .await;
                    }
                    None => {
                        self.hitl
                            .escalate(
                                out.issue,
                                "implementer finished without opening a pull request",
                                None,
                                false,
                            )
                            .await;
                    }
                }
            }
            WorkerRole::Review => {
                self.metrics
                    .record(|c| {
                        c.reviews_total += 1;
                        if !out.quality_fix {
                            c.first_pass_approvals += 1;
                        }
                    })
                    .await;
                // The merge watcher picks this up; the issue stays in review
                // until the host confirms the merge.
                self.store.set_status(out.issue, IssueStatus::Done).await;
            }
        }
    }
}
