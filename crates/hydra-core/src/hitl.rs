use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::event::EventKind;
use crate::host::{with_retry, HostError, IssueHost};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::scheduler::SchedulerHandle;
use crate::store::PipelineStore;
use crate::types::{HitlItem, HitlStatus, IssueStatus, Stage};

#[derive(Debug, Error)]
pub enum HitlError {
    #[error("issue #{0} is not detained in HITL")]
    NotFound(u64),
    #[error("issue #{0} is not a memory suggestion")]
    NotMemorySuggestion(u64),
    #[error("no running worker for issue #{0}")]
    NoWorker(u64),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Detains stuck or escalated issues and exposes the correction protocol.
///
/// An issue held here is invisible to the scheduler until one of the
/// resolution actions releases it.
pub struct HitlCoordinator {
    bus: Arc<EventBus>,
    store: Arc<PipelineStore>,
    metrics: Arc<Metrics>,
    host: Arc<dyn IssueHost>,
    pool: Arc<WorkerPool>,
    scheduler: SchedulerHandle,
    items: Mutex<HashMap<u64, HitlItem>>,
    /// In-flight worker questions awaiting a human answer.
    questions: Mutex<HashMap<u64, String>>,
}

impl HitlCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<PipelineStore>,
        metrics: Arc<Metrics>,
        host: Arc<dyn IssueHost>,
        pool: Arc<WorkerPool>,
        scheduler: SchedulerHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            metrics,
            host,
            pool,
            scheduler,
            items: Mutex::new(HashMap::new()),
            questions: Mutex::new(HashMap::new()),
        })
    }

    /// Detain an issue. Idempotent: an already-detained issue keeps its
    /// original cause.
    pub async fn escalate(
        &self,
        issue: u64,
        cause: impl Into<String>,
        pr: Option<u64>,
        memory_suggestion: bool,
    ) {
        let cause = cause.into();
        {
            let mut items = self.items.lock().await;
            if items.contains_key(&issue) {
                return;
            }
            let known = self.store.get(issue).await;
            let (title, branch, pr_url, known_pr) = match &known {
                Some((_, i)) => (i.title.clone(), i.branch.clone(), i.pr_url.clone(), i.pr),
                None => (format!("issue #{issue}"), None, None, None),
            };
            items.insert(
                issue,
                HitlItem {
                    issue,
                    title,
                    branch,
                    pr: pr.or(known_pr),
                    pr_url,
                    status: if memory_suggestion { HitlStatus::Approval } else { HitlStatus::Pending },
                    cause: cause.clone(),
                    is_memory_suggestion: memory_suggestion,
                },
            );
        }

        self.store.set_cause(issue, &cause).await;
        self.store
            .move_issue(issue, None, Stage::Hitl, IssueStatus::Hitl)
            .await;
        self.metrics.record(|c| c.hitl_escalations += 1).await;
        info!(issue, cause = %cause, "issue escalated to HITL");
        self.bus
            .publish(EventKind::HitlEscalation { issue, pr, cause })
            .await;
    }

    pub async fn list(&self) -> Vec<HitlItem> {
        let mut items: Vec<HitlItem> = self.items.lock().await.values().cloned().collect();
        items.sort_by_key(|i| i.issue);
        items
    }

    /// Attach correction feedback and re-admit the issue to the stage it
    /// escalated from.
    pub async fn retry(&self, issue: u64, feedback: &str) -> Result<(), HitlError> {
        let cause = {
            let mut items = self.items.lock().await;
            let item = items.get_mut(&issue).ok_or(HitlError::NotFound(issue))?;
            item.status = HitlStatus::Processing;
            item.cause.clone()
        };
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "retry".into(),
                status: "processing".into(),
            })
            .await;

        if !feedback.trim().is_empty() {
            self.pool.set_feedback(issue, feedback).await;
        }

        let stage = Self::origin_stage(&cause);
        self.items.lock().await.remove(&issue);
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "retry".into(),
                status: "resolved".into(),
            })
            .await;
        self.scheduler.enqueue(issue, stage);
        Ok(())
    }

    /// Detach the issue and return it to the triage backlog.
    pub async fn skip(&self, issue: u64) -> Result<(), HitlError> {
        self.items
            .lock()
            .await
            .remove(&issue)
            .ok_or(HitlError::NotFound(issue))?;
        self.store
            .move_issue(issue, Some(Stage::Hitl), Stage::Triage, IssueStatus::Queued)
            .await;
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "skip".into(),
                status: "resolved".into(),
            })
            .await;
        Ok(())
    }

    /// Close the issue on the host and drop it from the pipeline. An item
    /// without a PR needs no PR cleanup — the host owns PR lifecycle.
    pub async fn close(&self, issue: u64) -> Result<(), HitlError> {
        if !self.items.lock().await.contains_key(&issue) {
            return Err(HitlError::NotFound(issue));
        }
        let host = Arc::clone(&self.host);
        with_retry("close_issue", || {
            let host = Arc::clone(&host);
            async move { host.close_issue(issue).await }
        })
        .await?;

        self.items.lock().await.remove(&issue);
        self.store.remove_closed(issue).await;
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "close".into(),
                status: "resolved".into(),
            })
            .await;
        Ok(())
    }

    /// Terminal approval for the memory-suggestion variant.
    pub async fn approve_as_memory(&self, issue: u64) -> Result<(), HitlError> {
        {
            let items = self.items.lock().await;
            let item = items.get(&issue).ok_or(HitlError::NotFound(issue))?;
            if !item.is_memory_suggestion {
                return Err(HitlError::NotMemorySuggestion(issue));
            }
        }
        self.items.lock().await.remove(&issue);
        self.store.remove_closed(issue).await;
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "approved".into(),
                status: "resolved".into(),
            })
            .await;
        Ok(())
    }

    /// Answer an in-flight worker question; independent of escalation.
    pub async fn answer(&self, issue: u64, answer: &str) -> Result<(), HitlError> {
        if !self.pool.answer(issue, answer).await {
            return Err(HitlError::NoWorker(issue));
        }
        self.questions.lock().await.remove(&issue);
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "answer".into(),
                status: "resolved".into(),
            })
            .await;
        Ok(())
    }

    /// Register a question raised by a running worker.
    pub async fn question(&self, issue: u64, text: String) {
        self.questions.lock().await.insert(issue, text);
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "question".into(),
                status: "pending".into(),
            })
            .await;
    }

    pub async fn pending_questions(&self) -> HashMap<u64, String> {
        self.questions.lock().await.clone()
    }

    /// Manual correction from a reviewer: detain, attach feedback, and
    /// enqueue into the requested stage. Admission still honors the stage's
    /// enabled flag — a correction never bypasses an operator toggle.
    pub async fn request_changes(
        &self,
        issue: u64,
        feedback: &str,
        stage: Stage,
    ) -> Result<(), HitlError> {
        if self.store.get(issue).await.is_none() {
            warn!(issue, "request-changes for unknown issue");
            return Err(HitlError::NotFound(issue));
        }
        let pr = self.store.get(issue).await.and_then(|(_, i)| i.pr);
        self.escalate(issue, format!("changes requested, rerun {stage}"), pr, false)
            .await;

        if !feedback.trim().is_empty() {
            self.pool.set_feedback(issue, feedback).await;
        }
        self.items.lock().await.remove(&issue);
        self.bus
            .publish(EventKind::HitlUpdate {
                issue,
                action: "request-changes".into(),
                status: "resolved".into(),
            })
            .await;
        self.scheduler.enqueue(issue, stage);
        Ok(())
    }

    /// The stage an escalation cause points back to. CI failures re-run the
    /// implementer; unattributable causes restart at triage.
    fn origin_stage(cause: &str) -> Stage {
        if let Some(rest) = cause.strip_prefix("from ") {
            if let Some(stage) = Stage::parse(rest.trim()) {
                return stage;
            }
        }
        if cause.contains("ci-failed") || cause.contains("pull request") {
            return Stage::Implement;
        }
        Stage::Triage
    }
}
