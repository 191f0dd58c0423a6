use std::{sync::Arc, time::Duration};

use crawldesk_control::{
    artifacts::ArtifactLayout,
    graph::GraphGenerator,
    handlers,
    identity::AuthTable,
    idle_reaper::IdleSessionReaper,
    launcher::JobLauncher,
    liveness::AuthActivity,
    reaper::CompletionReaper,
    registry::SessionRegistry,
    settings::Settings,
    state::AppState,
    worker::ProcessSpawner,
};
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

async fn init_db_and_migrate() -> anyhow::Result<DatabaseConnection> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = crawldesk_db::connect(&database_url).await?;

    // Apply migrations on boot (idempotent).
    crawldesk_migration::Migrator::up(&db, None).await?;
    Ok(db)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();
    let db = Arc::new(init_db_and_migrate().await?);

    let layout = ArtifactLayout::new(settings.data_root.clone());
    layout.ensure().await?;
    tracing::info!(data_root = %layout.root().display(), worker = %settings.worker_bin.display(), "artifact layout ready");

    let spawner = ProcessSpawner::new(settings.worker_bin.clone(), settings.cancel_grace)
        .with_log_limits(settings.log_file_max_bytes, settings.log_file_max_files);
    let launcher = JobLauncher::new(layout.clone(), Arc::new(spawner));
    let registry = SessionRegistry::new(launcher, settings.max_active_jobs);

    let shutdown = CancellationToken::new();
    let completion_reaper =
        CompletionReaper::new(registry.clone(), settings.reap_interval).spawn(shutdown.clone());
    let idle_reaper = IdleSessionReaper::new(
        registry.clone(),
        Arc::new(AuthActivity::new(db.clone(), settings.liveness_window)),
        layout.clone(),
        settings.session_idle,
        settings.idle_sweep_interval,
    )
    .spawn(shutdown.clone());

    let graph = GraphGenerator::new(
        settings.graph_processor.clone(),
        settings.graph_args(),
        layout.clone(),
        settings.graph_timeout,
    );

    let bind = settings.bind;
    let state = AppState {
        registry: registry.clone(),
        identity: Arc::new(AuthTable::new(db)),
        graph,
        settings: Arc::new(settings),
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "crawldesk-control HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Workers get their grace period; the completion reaper stops with the rest.
    let cancelled = registry.cancel_all_jobs().await;
    if cancelled > 0 {
        tracing::info!(count = cancelled, "cancelling running crawl jobs");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            let mut remaining = 0;
            for session in registry.sessions().await {
                session.drain_completions().await;
                remaining += session.active_count().await;
            }
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    shutdown.cancel();
    let _ = completion_reaper.await;
    let _ = idle_reaper.await;
    tracing::info!("crawldesk-control stopped");

    Ok(())
}
