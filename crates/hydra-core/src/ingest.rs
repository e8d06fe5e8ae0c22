use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::bus::EventBus;
use crate::config::Config;
use crate::event::EventKind;
use crate::host::{with_retry, HostError, IssueHost};
use crate::store::PipelineStore;
use crate::types::{Issue, IssueStatus, Stage};

/// Maximum accepted intent length in bytes.
pub const MAX_INTENT_BYTES: usize = 10 * 1024;

/// Title length cut from the intent's first line.
const TITLE_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid intent: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Accepts free-form intent text and enrolls it in the pipeline as a host
/// issue. The host is the source of truth: nothing is enrolled unless the
/// issue was created there first.
pub struct IntentIngestor {
    bus: Arc<EventBus>,
    store: Arc<PipelineStore>,
    host: Arc<dyn IssueHost>,
    config: Arc<Config>,
}

impl IntentIngestor {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<PipelineStore>,
        host: Arc<dyn IssueHost>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self { bus, store, host, config })
    }

    /// Validate, create the host issue, and queue it for triage. Returns the
    /// new issue number.
    pub async fn submit_intent(&self, text: &str) -> Result<u64, IngestError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(IngestError::Invalid("intent text is empty"));
        }
        if text.len() > MAX_INTENT_BYTES {
            return Err(IngestError::Invalid("intent text exceeds 10 kB"));
        }

        let title: String = text
            .lines()
            .next()
            .unwrap_or(text)
            .chars()
            .take(TITLE_CHARS)
            .collect();

        let label = self.config.pipeline_label.clone();
        let host = Arc::clone(&self.host);
        let body = text.to_string();
        let created = with_retry("create_issue", || {
            let host = Arc::clone(&host);
            let title = title.clone();
            let body = body.clone();
            let label = label.clone();
            async move { host.create_issue(&title, &body, &label).await }
        })
        .await;

        let created = match created {
            Ok(c) => c,
            Err(e) => {
                self.bus
                    .publish(EventKind::IntentFailed { message: e.to_string() })
                    .await;
                return Err(e.into());
            }
        };

        self.store
            .upsert(
                Issue::new(created.number, created.title, created.url),
                Stage::Triage,
                IssueStatus::Queued,
            )
            .await;

        info!(issue = created.number, "intent enrolled for triage");
        self.bus
            .publish(EventKind::IntentCreated {
                issue: created.number,
                text: text.to_string(),
            })
            .await;

        Ok(created.number)
    }
}
