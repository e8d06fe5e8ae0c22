use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::metrics::{Counters, MetricsSnapshot, SNAPSHOT_RING};

/// Persistence seam for state that outlives the process: lifetime counters,
/// the metrics snapshot ring, and the last event id a session streamed.
/// Event history itself is process-local and never persisted.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn load_counters(&self) -> Result<Option<Counters>>;
    async fn save_counters(&self, counters: &Counters) -> Result<()>;
    async fn load_snapshots(&self) -> Result<Vec<MetricsSnapshot>>;
    async fn append_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()>;
    async fn load_last_event_id(&self) -> Result<Option<u64>>;
    async fn save_last_event_id(&self, id: u64) -> Result<()>;
}

// ── In-memory default ────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    counters: Option<Counters>,
    snapshots: Vec<MetricsSnapshot>,
    last_event_id: Option<u64>,
}

/// Default repository: keeps everything in process memory. Lifetime counters
/// survive session resets but not restarts.
#[derive(Default)]
pub struct InMemoryStats {
    state: Mutex<MemoryState>,
}

impl InMemoryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StatsRepository for InMemoryStats {
    async fn load_counters(&self) -> Result<Option<Counters>> {
        Ok(self.state.lock().await.counters)
    }

    async fn save_counters(&self, counters: &Counters) -> Result<()> {
        self.state.lock().await.counters = Some(*counters);
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<MetricsSnapshot>> {
        Ok(self.state.lock().await.snapshots.clone())
    }

    async fn append_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        state.snapshots.push(snapshot.clone());
        let excess = state.snapshots.len().saturating_sub(SNAPSHOT_RING);
        if excess > 0 {
            state.snapshots.drain(..excess);
        }
        Ok(())
    }

    async fn load_last_event_id(&self) -> Result<Option<u64>> {
        Ok(self.state.lock().await.last_event_id)
    }

    async fn save_last_event_id(&self, id: u64) -> Result<()> {
        self.state.lock().await.last_event_id = Some(id);
        Ok(())
    }
}

// ── File-backed variant ──────────────────────────────────────────────────

/// JSON files under the data directory. Writes go through a temp file and
/// rename so a crash mid-write never corrupts existing state.
pub struct FileStats {
    dir: PathBuf,
}

impl FileStats {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create stats dir {}", dir.display()))?;
        Ok(Arc::new(Self { dir }))
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = serde_json::from_str(&contents)
                    .with_context(|| format!("parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StatsRepository for FileStats {
    async fn load_counters(&self) -> Result<Option<Counters>> {
        self.read_json("counters.json").await
    }

    async fn save_counters(&self, counters: &Counters) -> Result<()> {
        self.write_json("counters.json", counters).await
    }

    async fn load_snapshots(&self) -> Result<Vec<MetricsSnapshot>> {
        Ok(self.read_json("snapshots.json").await?.unwrap_or_default())
    }

    async fn append_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let mut snapshots: Vec<MetricsSnapshot> =
            self.read_json("snapshots.json").await?.unwrap_or_default();
        snapshots.push(snapshot.clone());
        let excess = snapshots.len().saturating_sub(SNAPSHOT_RING);
        if excess > 0 {
            snapshots.drain(..excess);
        }
        self.write_json("snapshots.json", &snapshots).await
    }

    async fn load_last_event_id(&self) -> Result<Option<u64>> {
        self.read_json("last_event_id.json").await
    }

    async fn save_last_event_id(&self, id: u64) -> Result<()> {
        self.write_json("last_event_id.json", &id).await
    }
}
