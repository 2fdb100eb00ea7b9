use std::sync::Arc;

use anyhow::Context;
use tracing::{Level, info, warn};

use refstore::build_router;
use refstore::config::AppConfig;
use refstore::database::init_db;
use refstore::files::StorageService;
use refstore::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db = init_db(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    info!("Database ready");

    let storage = StorageService::new(db, &config.storage)
        .await
        .context("Failed to initialize storage")?;

    if config.storage.audit_on_startup {
        run_audit(&storage).await;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        config,
        storage: Arc::new(storage),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Server running at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn run_audit(storage: &StorageService) {
    let report = match storage.audit().await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Startup audit failed");
            return;
        }
    };

    for record in &report.missing_files {
        warn!(id = record.id, filepath = %record.filepath, "Record has no file on disk");
    }
    for record in &report.malformed {
        warn!(
            id = record.id,
            filepath = %record.filepath,
            stored_filename = %record.stored_filename,
            "Record does not describe a file under the storage root"
        );
    }

    if report.is_clean() {
        info!(checked = report.checked, "Startup audit clean");
    } else {
        warn!(
            checked = report.checked,
            missing = report.missing_files.len(),
            malformed = report.malformed.len(),
            "Startup audit found inconsistencies"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
