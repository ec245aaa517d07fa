use anyhow::Result;
use axum::Router;
use dedup_store::{config::AppConfig, db, engine::Engine, queue::Broker, routes};
use std::{fs, io::ErrorKind, path::Path};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config, mode and migrate flag ---
    let (cfg, mode, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(?mode, "Starting dedup-store with config: {:?}", cfg);
    if cfg.uses_default_secret() {
        tracing::warn!(
            "DEDUP_STORE_PRESIGN_SECRET is unset; presigned URLs use the placeholder secret"
        );
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite and schema ---
    let pool = db::connect(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Wire the engine ---
    let engine = Engine::build(cfg, pool).await?;
    engine.broker.declare_topology().await?;

    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if let Some(cluster) = &engine.cluster {
        if let Err(err) = cluster.rescan_usage().await {
            tracing::warn!(error = %err, "could not rescan node usage");
        }
        if mode.serves_http() {
            background.push(
                cluster
                    .clone()
                    .start_migration_monitor(engine.config.cluster.migration_interval, cancel.clone()),
            );
        }
    }

    if mode.runs_workers() {
        match engine
            .tasks
            .recover_stale(engine.config.worker.stale_task_after)
            .await
        {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "re-queued stale download tasks"),
            Err(err) => tracing::warn!(error = %err, "could not recover stale download tasks"),
        }

        let worker = engine.worker();
        let token = cancel.clone();
        background.push(tokio::spawn(async move {
            if let Err(err) = worker.run(token).await {
                tracing::error!(error = %err, "download worker stopped");
            }
        }));
    }

    // --- Shutdown on Ctrl+C ---
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "could not listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested");
            cancel.cancel();
        });
    }

    if mode.serves_http() {
        // --- Build router ---
        let app: Router = routes::routes::routes().with_state(engine.state());

        // --- Start server ---
        let addr = engine.config.addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err)
                if err.kind() == ErrorKind::PermissionDenied
                    && matches!(engine.config.host.as_str(), "0.0.0.0" | "::") =>
            {
                let fallback_addr = format!("127.0.0.1:{}", engine.config.port);
                tracing::warn!(
                    "Permission denied binding to {} ({}). Falling back to {}",
                    addr,
                    err,
                    fallback_addr
                );
                TcpListener::bind(&fallback_addr).await?
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!("Server listening on http://{}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await?;
        cancel.cancel();
    } else {
        cancel.cancelled().await;
    }

    for handle in background {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "background task panicked");
        }
    }
    tracing::info!("Stopped");

    Ok(())
}
