use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::types::Stage;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub issue_host_url: String,
    pub issue_host_token: String,
    /// Path to the agent binary spawned for every worker.
    pub agent_command: String,

    // Stage caps
    pub max_triagers: usize,
    pub max_planners: usize,
    pub max_workers: usize,
    pub max_reviewers: usize,

    pub listen_addr: String,
    pub data_dir: String,
    /// Issues carrying this label on the host belong to the pipeline.
    pub pipeline_label: String,
    pub dashboard_dist_dir: String,

    pub snapshot_interval_sec: u64,
    pub agent_timeout_s: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let config = Config {
            issue_host_url: get_str("ISSUE_HOST_URL", &dotenv, ""),
            issue_host_token: get_str("ISSUE_HOST_TOKEN", &dotenv, ""),
            agent_command: get_str("AGENT_COMMAND", &dotenv, ""),
            max_triagers: get_usize("MAX_TRIAGERS", &dotenv, 2),
            max_planners: get_usize("MAX_PLANNERS", &dotenv, 2),
            max_workers: get_usize("MAX_WORKERS", &dotenv, 3),
            max_reviewers: get_usize("MAX_REVIEWERS", &dotenv, 2),
            listen_addr: get_str("LISTEN_ADDR", &dotenv, "127.0.0.1:4400"),
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            pipeline_label: get_str("PIPELINE_LABEL", &dotenv, "hydra"),
            dashboard_dist_dir: get_str("DASHBOARD_DIST_DIR", &dotenv, "dashboard/dist"),
            snapshot_interval_sec: get_u64("SNAPSHOT_INTERVAL_SEC", &dotenv, 300),
            agent_timeout_s: get_u64("AGENT_TIMEOUT_S", &dotenv, 1_800),
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup validation; failures here are fatal (exit 2).
    pub fn validate(&self) -> Result<()> {
        if self.issue_host_url.is_empty() {
            bail!("ISSUE_HOST_URL must be set");
        }
        if !self.issue_host_url.starts_with("http://") && !self.issue_host_url.starts_with("https://") {
            bail!("ISSUE_HOST_URL must be an http(s) URL, got {:?}", self.issue_host_url);
        }
        if self.agent_command.is_empty() {
            bail!("AGENT_COMMAND must be set");
        }
        if self.max_triagers == 0 || self.max_planners == 0 || self.max_workers == 0 || self.max_reviewers == 0 {
            bail!("stage worker caps must all be at least 1");
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("LISTEN_ADDR is not a valid socket address: {:?}", self.listen_addr);
        }
        if self.snapshot_interval_sec == 0 {
            bail!("SNAPSHOT_INTERVAL_SEC must be at least 1");
        }
        Ok(())
    }

    /// Concurrency cap for a working stage.
    pub fn cap(&self, stage: Stage) -> usize {
        match stage {
            Stage::Triage => self.max_triagers,
            Stage::Plan => self.max_planners,
            Stage::Implement => self.max_workers,
            Stage::Review => self.max_reviewers,
            Stage::Merged | Stage::Hitl => 0,
        }
    }
}
