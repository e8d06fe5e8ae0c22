use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Snapshot ring capacity: 24 h at the 5-minute snapshot cadence.
pub const SNAPSHOT_RING: usize = 288;

/// Monotonic pipeline counters. The lifetime set survives restarts through
/// the stats repository; the session set resets with the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub issues_admitted: u64,
    pub issues_completed: u64,
    pub prs_opened: u64,
    pub prs_merged: u64,
    pub hitl_escalations: u64,
    pub reviews_total: u64,
    pub first_pass_approvals: u64,
    pub implementations: u64,
    pub quality_fixes: u64,
}

/// One periodic snapshot: counters plus the derived rates at that moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: Counters,
    pub merge_rate: f64,
    pub first_pass_approval_rate: f64,
    pub quality_fix_rate: f64,
    pub hitl_escalation_rate: f64,
}

fn rate(num: u64, denom: u64) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

struct MetricsInner {
    lifetime: Counters,
    session: Counters,
    ring: VecDeque<MetricsSnapshot>,
}

/// Owner of all pipeline counters; increments arrive as method calls from the
/// single-writer components, reads get copies.
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MetricsInner {
                lifetime: Counters::default(),
                session: Counters::default(),
                ring: VecDeque::with_capacity(SNAPSHOT_RING),
            }),
        })
    }

    /// Seed lifetime counters and snapshot history from persisted state.
    pub async fn restore(&self, counters: Counters, snapshots: Vec<MetricsSnapshot>) {
        let mut inner = self.inner.lock().await;
        inner.lifetime = counters;
        inner.ring = snapshots.into_iter().collect();
        while inner.ring.len() > SNAPSHOT_RING {
            inner.ring.pop_front();
        }
    }

    pub async fn record(&self, f: impl Fn(&mut Counters)) {
        let mut inner = self.inner.lock().await;
        f(&mut inner.lifetime);
        f(&mut inner.session);
    }

    pub async fn lifetime(&self) -> Counters {
        self.inner.lock().await.lifetime
    }

    pub async fn session(&self) -> Counters {
        self.inner.lock().await.session
    }

    /// Zero the session counters; lifetime counters are untouched.
    pub async fn reset_session(&self) {
        self.inner.lock().await.session = Counters::default();
    }

    /// Build a snapshot from the lifetime counters and append it to the ring.
    pub async fn take_snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock().await;
        let snapshot = snapshot_of(inner.lifetime);
        inner.ring.push_back(snapshot.clone());
        if inner.ring.len() > SNAPSHOT_RING {
            inner.ring.pop_front();
        }
        snapshot
    }

    /// Current derived view without appending to the ring.
    pub async fn current(&self) -> MetricsSnapshot {
        snapshot_of(self.inner.lock().await.lifetime)
    }

    pub async fn history(&self) -> Vec<MetricsSnapshot> {
        self.inner.lock().await.ring.iter().cloned().collect()
    }
}

fn snapshot_of(counters: Counters) -> MetricsSnapshot {
    MetricsSnapshot {
        timestamp: Utc::now(),
        counters,
        merge_rate: rate(counters.prs_merged, counters.prs_opened),
        first_pass_approval_rate: rate(counters.first_pass_approvals, counters.reviews_total),
        quality_fix_rate: rate(counters.quality_fixes, counters.implementations),
        hitl_escalation_rate: rate(counters.hitl_escalations, counters.issues_admitted),
    }
}
