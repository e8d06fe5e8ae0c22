use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::app::ShutdownHandle;
use crate::bus::EventBus;
use crate::config::Config;
use crate::event::{EventKind, OrchestratorStatus};
use crate::hitl::HitlCoordinator;
use crate::host::{with_retry, HostError, IssueHost};
use crate::metrics::Metrics;
use crate::stats::StatsRepository;
use crate::store::PipelineStore;
use crate::types::{Issue, IssueStatus, Stage};

pub const PR_MERGE_WATCHER: &str = "pr-merge-watcher";
pub const CI_STATUS_WATCHER: &str = "ci-status-watcher";
pub const PIPELINE_RECONCILER: &str = "pipeline-reconciler";
pub const LIFETIME_STATS: &str = "lifetime-stats";
pub const METRICS_SNAPSHOT: &str = "metrics-snapshot";

/// Heartbeat cadence for `background_worker_status`.
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Ok,
    Error,
    Disabled,
}

/// Health record for one background loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    pub name: String,
    pub enabled: bool,
    pub interval_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub status: LoopStatus,
    pub detail: String,
}

/// The periodic pollers: PR-merge watcher, CI-status watcher, pipeline
/// reconciler, lifetime-stats persister, and metrics snapshotter. Each loop
/// is independently toggleable, its cadence adjustable at runtime, and all
/// report health through heartbeat events.
pub struct BackgroundWorkers {
    bus: Arc<EventBus>,
    store: Arc<PipelineStore>,
    hitl: Arc<HitlCoordinator>,
    metrics: Arc<Metrics>,
    host: Arc<dyn IssueHost>,
    repo: Arc<dyn StatsRepository>,
    config: Arc<Config>,
    shutdown: ShutdownHandle,
    states: Mutex<HashMap<&'static str, LoopState>>,
}

impl BackgroundWorkers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<PipelineStore>,
        hitl: Arc<HitlCoordinator>,
        metrics: Arc<Metrics>,
        host: Arc<dyn IssueHost>,
        repo: Arc<dyn StatsRepository>,
        config: Arc<Config>,
        shutdown: ShutdownHandle,
    ) -> Arc<Self> {
        let mut states = HashMap::new();
        for (name, interval) in [
            (PR_MERGE_WATCHER, 15),
            (CI_STATUS_WATCHER, 30),
            (PIPELINE_RECONCILER, 60),
            (LIFETIME_STATS, 60),
            (METRICS_SNAPSHOT, config.snapshot_interval_sec),
        ] {
            states.insert(
                name,
                LoopState {
                    name: name.to_string(),
                    enabled: true,
                    interval_seconds: interval,
                    last_run: None,
                    status: LoopStatus::Ok,
                    detail: String::new(),
                },
            );
        }
        Arc::new(Self {
            bus,
            store,
            hitl,
            metrics,
            host,
            repo,
            config,
            shutdown,
            states: Mutex::new(states),
        })
    }

    /// Spawn every loop driver plus the heartbeat task.
    pub fn start(self: &Arc<Self>) {
        for name in [
            PR_MERGE_WATCHER,
            CI_STATUS_WATCHER,
            PIPELINE_RECONCILER,
            LIFETIME_STATS,
            METRICS_SNAPSHOT,
        ] {
            let workers = Arc::clone(self);
            tokio::spawn(async move { workers.drive(name).await });
        }
        let workers = Arc::clone(self);
        tokio::spawn(async move { workers.heartbeat().await });
    }

    /// One loop driver: 1 s resolution over a runtime-adjustable interval.
    async fn drive(self: Arc<Self>, name: &'static str) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            let due = {
                let mut states = self.states.lock().await;
                let Some(state) = states.get_mut(name) else { return };
                if !state.enabled {
                    state.status = LoopStatus::Disabled;
                    continue;
                }
                let elapsed = state
                    .last_run
                    .map(|t| (Utc::now() - t).num_seconds())
                    .unwrap_or(i64::MAX);
                if elapsed < state.interval_seconds as i64 {
                    continue;
                }
                state.last_run = Some(Utc::now());
                true
            };
            if !due {
                continue;
            }

            let result = match name {
                PR_MERGE_WATCHER => self.run_merge_watch().await,
                CI_STATUS_WATCHER => self.run_ci_watch().await,
                PIPELINE_RECONCILER => self.run_reconcile().await,
                LIFETIME_STATS => self.run_lifetime_stats().await,
                METRICS_SNAPSHOT => self.run_snapshot().await,
                _ => Ok(String::new()),
            };

            match result {
                Ok(detail) => self.mark(name, LoopStatus::Ok, detail).await,
                Err(HostError::Auth(msg)) => {
                    error!(loop_name = name, "host authentication failed: {msg}");
                    self.bus
                        .publish(EventKind::OrchestratorStatus {
                            status: OrchestratorStatus::AuthFailed,
                            reset: false,
                        })
                        .await;
                    self.shutdown.request(3);
                    return;
                }
                Err(e) => {
                    warn!(loop_name = name, "background loop error: {e}");
                    self.bus
                        .publish(EventKind::Error {
                            kind: e.kind().to_string(),
                            message: format!("{name}: {e}"),
                        })
                        .await;
                    self.mark(name, LoopStatus::Error, e.to_string()).await;
                }
            }
        }
    }

    async fn mark(&self, name: &'static str, status: LoopStatus, detail: String) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(name) {
            state.status = status;
            state.detail = detail;
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        loop {
            tokio::time::sleep(HEARTBEAT).await;
            let states: Vec<LoopState> = self.states.lock().await.values().cloned().collect();
            for state in states {
                self.bus
                    .publish(EventKind::BackgroundWorkerStatus {
                        name: state.name.clone(),
                        status: state.status,
                        last_run: state.last_run,
                        detail: state.detail.clone(),
                    })
                    .await;
            }
        }
    }

    // ── Loop bodies ──────────────────────────────────────────────────────

    /// Attempt merges for review-approved PRs and record merges the host
    /// reports, exactly once per PR.
    async fn run_merge_watch(&self) -> Result<String, HostError> {
        let mut merged = 0usize;
        for pull in self.store.open_prs().await {
            let issue_state = self.store.get(pull.issue).await;
            let review_done = matches!(
                &issue_state,
                Some((Stage::Review, issue)) if issue.status == IssueStatus::Done
            );

            if review_done {
                let host = Arc::clone(&self.host);
                let pr = pull.pr;
                let attempt = with_retry("merge_pr", || {
                    let host = Arc::clone(&host);
                    async move { host.merge_pr(pr).await }
                })
                .await;
                if let Err(e) = attempt {
                    match e {
                        HostError::Auth(_) => return Err(e),
                        HostError::Permanent { .. } => {
                            self.hitl
                                .escalate(pull.issue, format!("merge failed: {e}"), Some(pull.pr), false)
                                .await;
                            continue;
                        }
                        HostError::Transient(_) => {
                            warn!(pr = pull.pr, "merge attempt failed: {e}");
                            continue;
                        }
                    }
                }
            }

            let host = Arc::clone(&self.host);
            let pr = pull.pr;
            let is_merged = with_retry("pr_merged", || {
                let host = Arc::clone(&host);
                async move { host.pr_merged(pr).await }
            })
            .await;

            match is_merged {
                Ok(true) => {
                    if let Some((issue, newly)) = self.store.mark_merged(pull.pr).await {
                        if newly {
                            merged += 1;
                            info!(pr = pull.pr, issue, "pull request merged");
                            self.bus
                                .publish(EventKind::MergeUpdate {
                                    pr: pull.pr,
                                    status: "merged".into(),
                                })
                                .await;
                            self.store
                                .move_issue(issue, None, Stage::Merged, IssueStatus::Done)
                                .await;
                            self.metrics
                                .record(|c| {
                                    c.prs_merged += 1;
                                    c.issues_completed += 1;
                                })
                                .await;
                        }
                    }
                }
                Ok(false) => {}
                Err(HostError::Auth(msg)) => return Err(HostError::Auth(msg)),
                Err(HostError::Permanent { status, message }) => {
                    self.hitl
                        .escalate(
                            pull.issue,
                            format!("merge state check failed ({status}): {message}"),
                            Some(pull.pr),
                            false,
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(format!("{merged} merged"))
    }

    /// Escalate issues whose PR CI is failing and which are not mid-merge.
    async fn run_ci_watch(&self) -> Result<String, HostError> {
        let mut failing = 0usize;
        for pull in self.store.open_prs().await {
            let skip = match self.store.get(pull.issue).await {
                // Already detained, merged, or review-approved (merging).
                Some((Stage::Hitl | Stage::Merged, _)) => true,
                Some((Stage::Review, issue)) => issue.status == IssueStatus::Done,
                Some(_) => false,
                None => true,
            };
            if skip {
                continue;
            }

            let host = Arc::clone(&self.host);
            let pr = pull.pr;
            let verdict = with_retry("ci_passing", || {
                let host = Arc::clone(&host);
                async move { host.ci_passing(pr).await }
            })
            .await;

            match verdict {
                Ok(Some(false)) => {
                    failing += 1;
                    self.hitl
                        .escalate(pull.issue, "ci-failed", Some(pull.pr), false)
                        .await;
                }
                Ok(_) => {}
                Err(HostError::Auth(msg)) => return Err(HostError::Auth(msg)),
                Err(HostError::Permanent { status, message }) => {
                    self.hitl
                        .escalate(
                            pull.issue,
                            format!("ci status check failed ({status}): {message}"),
                            Some(pull.pr),
                            false,
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(format!("{failing} failing"))
    }

    /// Pull the host's labeled issue list and reconcile the pipeline store:
    /// unknown issues enter triage, externally closed issues leave.
    async fn run_reconcile(&self) -> Result<String, HostError> {
        let host = Arc::clone(&self.host);
        let label = self.config.pipeline_label.clone();
        let mut issues = with_retry("list_open_issues", || {
            let host = Arc::clone(&host);
            let label = label.clone();
            async move { host.list_open_issues(&label).await }
        })
        .await?;
        issues.sort_by_key(|i| i.number);

        let mut added = 0usize;
        let open: HashSet<u64> = issues.iter().map(|i| i.number).collect();
        for hi in issues {
            let issue = Issue::new(hi.number, hi.title, hi.url);
            if self.store.upsert(issue, Stage::Triage, IssueStatus::Queued).await {
                added += 1;
            }
        }

        // Anything we track that the host no longer lists open was closed
        // outside the pipeline. Review-stage issues with a PR are left to the
        // merge watcher — a merge closes the issue on most hosts.
        let mut removed = 0usize;
        let snapshot = self.store.snapshot().await;
        for (stage, bucket) in snapshot {
            if stage == Stage::Merged {
                continue;
            }
            for issue in bucket {
                if open.contains(&issue.number) {
                    continue;
                }
                if stage == Stage::Review && issue.pr.is_some() {
                    continue;
                }
                info!(issue = issue.number, "issue closed on host, removing");
                self.store.remove_closed(issue.number).await;
                removed += 1;
            }
        }
        Ok(format!("{added} added, {removed} removed"))
    }

    async fn run_lifetime_stats(&self) -> Result<String, HostError> {
        let counters = self.metrics.lifetime().await;
        self.repo
            .save_counters(&counters)
            .await
            .map_err(|e| HostError::Transient(format!("stats repository: {e}")))?;
        let last_id = self.bus.last_id().await;
        self.repo
            .save_last_event_id(last_id)
            .await
            .map_err(|e| HostError::Transient(format!("stats repository: {e}")))?;
        Ok(format!("counters saved at event {last_id}"))
    }

    async fn run_snapshot(&self) -> Result<String, HostError> {
        let snapshot = self.metrics.take_snapshot().await;
        self.repo
            .append_snapshot(&snapshot)
            .await
            .map_err(|e| HostError::Transient(format!("stats repository: {e}")))?;
        self.bus.publish(EventKind::MetricsUpdate { snapshot }).await;
        Ok("snapshot taken".into())
    }

    // ── Control surface ──────────────────────────────────────────────────

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut states = self.states.lock().await;
        match states.values_mut().find(|s| s.name == name) {
            Some(state) => {
                state.enabled = enabled;
                if enabled {
                    state.status = LoopStatus::Ok;
                    // Run promptly after re-enabling.
                    state.last_run = None;
                } else {
                    state.status = LoopStatus::Disabled;
                }
                true
            }
            None => false,
        }
    }

    pub async fn set_interval(&self, name: &str, interval_seconds: u64) -> bool {
        if interval_seconds == 0 {
            return false;
        }
        let mut states = self.states.lock().await;
        match states.values_mut().find(|s| s.name == name) {
            Some(state) => {
                state.interval_seconds = interval_seconds;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<LoopState> {
        let mut states: Vec<LoopState> = self.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }
}
