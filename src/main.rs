//! lanpulse controller binary.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanpulse::alerts::AlertEngine;
use lanpulse::config::Config;
use lanpulse::db::{Store, TestKind};
use lanpulse::events::EventBus;
use lanpulse::notify::NotificationManager;
use lanpulse::orchestrator::Orchestrator;
use lanpulse::queue::TaskQueue;
use lanpulse::scheduler::{parse_duration, Scheduler};
use lanpulse::shell;
use lanpulse::web::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lanpulse=info".parse()?),
        )
        .init();

    let cfg = Config::load();
    tracing::info!("starting lanpulse on port {}", cfg.server_port);
    tracing::info!("using database at {}", cfg.database_path);
    tracing::info!("worker port {}", cfg.worker_port);

    if let Some(dir) = Path::new(&cfg.database_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }
    let store = Arc::new(Store::new(&cfg.database_path).context("failed to open database")?);

    seed_default_schedules(&store, &cfg);

    let key_path = match &cfg.ssh_key_path {
        Some(path) => path.clone(),
        None => shell::default_key_path().context("no SSH private key available")?,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        cfg.worker_path.clone().into(),
        cfg.worker_port,
        key_path,
    ));

    let queue = Arc::new(TaskQueue::new());
    let bus = EventBus::new();
    let notifier = Arc::new(NotificationManager::new(store.clone()));
    let alerts = Arc::new(AlertEngine::new(store.clone(), notifier.clone()));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        orchestrator,
        queue,
        bus.clone(),
        alerts,
    ));
    scheduler.clone().start();

    let server = Server::new(cfg.server_port, store, scheduler, notifier, bus);
    server.start().await.context("server failed")?;
    Ok(())
}

/// Create default ping and speed schedules when none exist. The intervals
/// come from `PING_SCHEDULE` / `SPEEDTEST_SCHEDULE` when set.
fn seed_default_schedules(store: &Store, cfg: &Config) {
    let existing = match store.get_schedules() {
        Ok(schedules) => schedules,
        Err(e) => {
            tracing::warn!("failed to check existing schedules: {}", e);
            return;
        }
    };

    let seeds = [
        (TestKind::Ping, cfg.ping_schedule.as_str(), "1m"),
        (TestKind::Speed, cfg.speed_schedule.as_str(), "15m"),
    ];

    for (kind, configured, fallback) in seeds {
        if existing.iter().any(|s| s.kind == kind) {
            continue;
        }
        let interval = if parse_duration(configured).is_ok() {
            configured
        } else {
            tracing::warn!(%kind, configured, "invalid schedule interval; using {}", fallback);
            fallback
        };
        match store.upsert_schedule(kind, interval, true) {
            Ok(()) => tracing::info!(%kind, interval, "created default schedule"),
            Err(e) => tracing::warn!(%kind, "failed to create default schedule: {}", e),
        }
    }
}
