use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::config::Config;
use crate::event::{EventKind, OrchestratorStatus};
use crate::hitl::HitlCoordinator;
use crate::host::IssueHost;
use crate::ingest::IntentIngestor;
use crate::loops::BackgroundWorkers;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::stats::StatsRepository;
use crate::store::PipelineStore;

/// Requests process termination with a specific exit code. The first request
/// wins; later requests are ignored.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<Option<i32>>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<Option<i32>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn request(&self, code: i32) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
    }
}

/// The assembled application: every component built once, wired by reference,
/// with a single lifecycle entry point. No globals.
pub struct Hydra {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub store: Arc<PipelineStore>,
    pub metrics: Arc<Metrics>,
    pub pool: Arc<WorkerPool>,
    pub scheduler: SchedulerHandle,
    pub hitl: Arc<HitlCoordinator>,
    pub ingest: Arc<IntentIngestor>,
    pub loops: Arc<BackgroundWorkers>,
    pub host: Arc<dyn IssueHost>,
    pub shutdown: ShutdownHandle,
}

impl Hydra {
    /// Build and start every component. The returned watch receiver resolves
    /// to the process exit code when any component requests shutdown.
    pub async fn build(
        config: Config,
        host: Arc<dyn IssueHost>,
        runner: Arc<dyn AgentRunner>,
        repo: Arc<dyn StatsRepository>,
    ) -> Result<(Arc<Hydra>, watch::Receiver<Option<i32>>)> {
        let config = Arc::new(config);
        let (shutdown, shutdown_rx) = ShutdownHandle::new();

        let bus = EventBus::new();
        let store = PipelineStore::new(Arc::clone(&bus));
        let metrics = Metrics::new();

        // Lifetime counters and snapshot history survive restarts.
        if let Some(counters) = repo.load_counters().await? {
            let snapshots = repo.load_snapshots().await.unwrap_or_default();
            metrics.restore(counters, snapshots).await;
            info!("restored lifetime counters from repository");
        }

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (question_tx, mut question_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let scheduler_handle = SchedulerHandle::new(cmd_tx);

        let pool = WorkerPool::new(Arc::clone(&bus), runner, outcome_tx, question_tx);
        let hitl = HitlCoordinator::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&metrics),
            Arc::clone(&host),
            Arc::clone(&pool),
            scheduler_handle.clone(),
        );
        let ingest = IntentIngestor::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&host),
            Arc::clone(&config),
        );
        let loops = BackgroundWorkers::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&hitl),
            Arc::clone(&metrics),
            Arc::clone(&host),
            repo,
            Arc::clone(&config),
            shutdown.clone(),
        );

        let scheduler = Scheduler::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&hitl),
            Arc::clone(&metrics),
            Arc::clone(&config),
            cmd_rx,
            outcome_rx,
        );
        tokio::spawn(scheduler.run());

        // Worker questions flow to the HITL coordinator's pending set.
        {
            let hitl = Arc::clone(&hitl);
            tokio::spawn(async move {
                while let Some((issue, text)) = question_rx.recv().await {
                    hitl.question(issue, text).await;
                }
            });
        }

        loops.start();

        bus.publish(EventKind::OrchestratorStatus {
            status: OrchestratorStatus::Idle,
            reset: false,
        })
        .await;

        Ok((
            Arc::new(Hydra {
                config,
                bus,
                store,
                metrics,
                pool,
                scheduler: scheduler_handle,
                hitl,
                ingest,
                loops,
                host,
                shutdown,
            }),
            shutdown_rx,
        ))
    }

    /// Graceful stop: halt admission, cancel workers, emit the terminal
    /// status, and request exit 0.
    pub async fn stop(&self) {
        self.scheduler.stop();
        // Give the scheduler loop a moment to process the stop before the
        // final status goes out.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        self.pool.cancel_all().await;
        self.bus
            .publish(EventKind::OrchestratorStatus {
                status: OrchestratorStatus::Stopped,
                reset: false,
            })
            .await;
        if self.bus.subscriber_count().await > 0 {
            warn!("stopping with live event subscribers");
        }
        self.shutdown.request(0);
    }
}
