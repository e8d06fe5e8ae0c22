use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::event::{EventKind, StageDepth};
use crate::types::{Issue, IssueStatus, PullRequest, Stage};

struct StoreInner {
    /// Per-stage buckets in enqueue order; the scheduler drains each bucket's
    /// queued entries front to back.
    stages: HashMap<Stage, Vec<Issue>>,
    prs: HashMap<u64, PullRequest>,
}

/// Source of truth for the set of in-flight issues and their stage membership.
///
/// Invariant: an issue number appears in exactly one stage bucket. Every
/// mutation publishes a `pipeline_update` so clients receive deltas instead
/// of the whole table.
pub struct PipelineStore {
    bus: Arc<EventBus>,
    inner: Mutex<StoreInner>,
}

impl PipelineStore {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let mut stages = HashMap::new();
        for stage in Stage::ALL {
            stages.insert(stage, Vec::new());
        }
        Arc::new(Self {
            bus,
            inner: Mutex::new(StoreInner {
                stages,
                prs: HashMap::new(),
            }),
        })
    }

    /// Atomic copy of every stage bucket.
    pub async fn snapshot(&self) -> HashMap<Stage, Vec<Issue>> {
        self.inner.lock().await.stages.clone()
    }

    pub async fn get(&self, number: u64) -> Option<(Stage, Issue)> {
        let inner = self.inner.lock().await;
        for stage in Stage::ALL {
            if let Some(issue) = inner.stages.get(&stage).and_then(|b| b.iter().find(|i| i.number == number)) {
                return Some((stage, issue.clone()));
            }
        }
        None
    }

    pub async fn contains(&self, number: u64) -> bool {
        self.get(number).await.is_some()
    }

    /// Move an issue between stages, setting the new status. A `from` of None
    /// searches all buckets. Moving an unknown issue to `merged` is allowed
    /// and records a terminal merge regardless of prior observation; any
    /// other unknown move is rejected.
    pub async fn move_issue(
        &self,
        number: u64,
        from: Option<Stage>,
        to: Stage,
        status: IssueStatus,
    ) -> bool {
        let event = {
            let mut inner = self.inner.lock().await;
            let mut found: Option<Issue> = None;
            let search: Vec<Stage> = match from {
                Some(s) => vec![s],
                None => Stage::ALL.to_vec(),
            };
            for stage in search {
                if let Some(bucket) = inner.stages.get_mut(&stage) {
                    if let Some(pos) = bucket.iter().position(|i| i.number == number) {
                        found = Some(bucket.remove(pos));
                        break;
                    }
                }
            }

            let mut issue = match found {
                Some(i) => i,
                None if to == Stage::Merged => {
                    info!(issue = number, "recording terminal merge for untracked issue");
                    Issue::new(number, format!("issue #{number}"), String::new())
                }
                None => {
                    warn!(issue = number, to = %to, "move for unknown issue ignored");
                    return false;
                }
            };

            issue.status = status;
            if to != Stage::Hitl {
                issue.cause = None;
            }
            if let Some(bucket) = inner.stages.get_mut(&to) {
                bucket.push(issue);
            }
            EventKind::PipelineUpdate { issue: number, stage: to, status }
        };
        self.bus.publish(event).await;
        true
    }

    /// In-place status change without a stage move.
    pub async fn set_status(&self, number: u64, status: IssueStatus) -> bool {
        let event = {
            let mut inner = self.inner.lock().await;
            let mut hit: Option<Stage> = None;
            for stage in Stage::ALL {
                if let Some(issue) = inner
                    .stages
                    .get_mut(&stage)
                    .and_then(|b| b.iter_mut().find(|i| i.number == number))
                {
                    issue.status = status;
                    hit = Some(stage);
                    break;
                }
            }
            match hit {
                Some(stage) => EventKind::PipelineUpdate { issue: number, stage, status },
                None => return false,
            }
        };
        self.bus.publish(event).await;
        true
    }

    /// Record a cause on an issue (set when escalating to HITL).
    pub async fn set_cause(&self, number: u64, cause: &str) {
        let mut inner = self.inner.lock().await;
        for stage in Stage::ALL {
            if let Some(issue) = inner
                .stages
                .get_mut(&stage)
                .and_then(|b| b.iter_mut().find(|i| i.number == number))
            {
                issue.cause = Some(cause.to_string());
                return;
            }
        }
    }

    /// Insert an issue if absent. Used by reconciliation; a no-op when the
    /// issue is already tracked anywhere in the pipeline.
    pub async fn upsert(&self, issue: Issue, stage: Stage, status: IssueStatus) -> bool {
        let event = {
            let mut inner = self.inner.lock().await;
            let known = Stage::ALL.iter().any(|s| {
                inner
                    .stages
                    .get(s)
                    .is_some_and(|b| b.iter().any(|i| i.number == issue.number))
            });
            if known {
                return false;
            }
            let number = issue.number;
            let mut issue = issue;
            issue.status = status;
            if let Some(bucket) = inner.stages.get_mut(&stage) {
                bucket.push(issue);
            }
            EventKind::PipelineUpdate { issue: number, stage, status }
        };
        self.bus.publish(event).await;
        true
    }

    /// Drop an issue the host reports closed outside the pipeline.
    pub async fn remove_closed(&self, number: u64) -> Option<Issue> {
        let (issue, event) = {
            let mut inner = self.inner.lock().await;
            let mut removed: Option<Issue> = None;
            for stage in Stage::ALL {
                if let Some(bucket) = inner.stages.get_mut(&stage) {
                    if let Some(pos) = bucket.iter().position(|i| i.number == number) {
                        removed = Some(bucket.remove(pos));
                        break;
                    }
                }
            }
            let issue = removed?;
            (
                issue,
                EventKind::PipelineUpdate {
                    issue: number,
                    stage: Stage::Merged,
                    status: IssueStatus::Done,
                },
            )
        };
        self.bus.publish(event).await;
        Some(issue)
    }

    /// Attach a freshly opened PR to its issue.
    pub async fn record_pr(&self, pr: PullRequest) {
        let mut inner = self.inner.lock().await;
        for stage in Stage::ALL {
            if let Some(issue) = inner
                .stages
                .get_mut(&stage)
                .and_then(|b| b.iter_mut().find(|i| i.number == pr.issue))
            {
                issue.pr = Some(pr.pr);
                issue.pr_url = Some(pr.url.clone());
                issue.branch = Some(pr.branch.clone());
                break;
            }
        }
        inner.prs.insert(pr.pr, pr);
    }

    /// Mark a PR merged. Returns the owning issue and whether this was the
    /// first observation; repeat calls are idempotent no-ops.
    pub async fn mark_merged(&self, pr: u64) -> Option<(u64, bool)> {
        let mut inner = self.inner.lock().await;
        let entry = inner.prs.get_mut(&pr)?;
        if entry.merged {
            return Some((entry.issue, false));
        }
        entry.merged = true;
        Some((entry.issue, true))
    }

    pub async fn open_prs(&self) -> Vec<PullRequest> {
        self.inner
            .lock()
            .await
            .prs
            .values()
            .filter(|p| !p.merged)
            .cloned()
            .collect()
    }

    pub async fn pr(&self, pr: u64) -> Option<PullRequest> {
        self.inner.lock().await.prs.get(&pr).cloned()
    }

    /// Queued/active counts per stage, for `queue_update` and `/api/queue`.
    pub async fn queue_depths(&self) -> HashMap<Stage, StageDepth> {
        let inner = self.inner.lock().await;
        let mut depths = HashMap::new();
        for stage in Stage::ALL {
            let bucket = match inner.stages.get(&stage) {
                Some(b) => b,
                None => continue,
            };
            let depth = StageDepth {
                queued: bucket.iter().filter(|i| i.status == IssueStatus::Queued).count(),
                active: bucket.iter().filter(|i| i.status == IssueStatus::Active).count(),
            };
            depths.insert(stage, depth);
        }
        depths
    }
}
