mod routes;
mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post},
    Router,
};
use hydra_agent::runner::CommandRunner;
use hydra_core::{
    app::Hydra,
    config::Config,
    host::HttpIssueHost,
    stats::{FileStats, InMemoryStats, StatsRepository},
};
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{error, info, warn};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub hydra: Arc<Hydra>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "hydra_server=info,hydra_core=info,hydra_agent=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let host = Arc::new(HttpIssueHost::new(
        config.issue_host_url.clone(),
        config.issue_host_token.clone(),
    ));
    let runner = Arc::new(
        CommandRunner::new(config.agent_command.clone())
            .with_timeout(Duration::from_secs(config.agent_timeout_s)),
    );
    let repo: Arc<dyn StatsRepository> = match FileStats::new(&config.data_dir) {
        Ok(repo) => repo,
        Err(e) => {
            warn!("stats directory unavailable ({e}), falling back to in-memory stats");
            InMemoryStats::new()
        }
    };

    let listen_addr = config.listen_addr.clone();
    let dashboard_dir = config.dashboard_dist_dir.clone();
    let (hydra, shutdown_rx) = Hydra::build(config, host, runner, repo).await?;

    let state = Arc::new(AppState {
        hydra: Arc::clone(&hydra),
        start_time: Instant::now(),
    });

    let serve_dir = ServeDir::new(&dashboard_dir).fallback(tower_http::services::ServeFile::new(
        format!("{dashboard_dir}/index.html"),
    ));

    let app = Router::new()
        // Live stream
        .route("/ws", get(ws::ws_handler))
        // Health
        .route("/api/health", get(routes::health))
        // Intents
        .route("/api/intent", post(routes::post_intent))
        // Pipeline views
        .route("/api/pipeline", get(routes::get_pipeline))
        .route("/api/prs", get(routes::get_prs))
        .route("/api/queue", get(routes::get_queue))
        // HITL
        .route("/api/hitl", get(routes::get_hitl))
        .route("/api/hitl/:issue/retry", post(routes::hitl_retry))
        .route("/api/hitl/:issue/skip", post(routes::hitl_skip))
        .route("/api/hitl/:issue/close", post(routes::hitl_close))
        .route("/api/hitl/:issue/approve", post(routes::hitl_approve))
        .route("/api/human-input", get(routes::get_human_input))
        .route("/api/human-input/:issue", post(routes::post_human_input))
        .route("/api/request-changes", post(routes::post_request_changes))
        // Control
        .route("/api/control/start", post(routes::control_start))
        .route("/api/control/stop", post(routes::control_stop))
        .route("/api/control/status", get(routes::control_status))
        .route("/api/control/stage", post(routes::control_stage))
        .route("/api/control/bg-worker", post(routes::control_bg_worker))
        .route(
            "/api/control/bg-worker/interval",
            post(routes::control_bg_worker_interval),
        )
        .route("/api/system/workers", get(routes::get_system_workers))
        // Metrics & stats
        .route("/api/metrics", get(routes::get_metrics))
        .route("/api/metrics/history", get(routes::get_metrics_history))
        .route("/api/metrics/github", get(routes::get_metrics_github))
        .route("/api/stats", get(routes::get_stats))
        // Event backfill
        .route("/api/events", get(routes::get_events))
        // Static dashboard
        .fallback_service(serve_dir)
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Interrupt → graceful stop → exit 0.
    {
        let hydra = Arc::clone(&hydra);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping orchestrator");
                hydra.stop().await;
            }
        });
    }

    info!("Listening on {listen_addr}");
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {listen_addr}: {e}");
            std::process::exit(2);
        }
    };

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.wait_for(|code| code.is_some()).await;
        })
        .await?;

    let code = (*shutdown_rx.borrow()).unwrap_or(0);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
