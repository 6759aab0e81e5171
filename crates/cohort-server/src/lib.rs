//! HTTP surface and SQLite storage for the Cohort study orchestrator.

pub mod api;
pub mod config;
pub mod db;
pub mod error;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use cohort_pipeline::{Pipeline, Severity, Study};

pub use api::{router, AppState};
pub use config::ServerConfig;
pub use db::SqliteStore;
pub use error::ApiError;

/// Load the pipeline, open the database, and serve until the process exits.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::load(&config.pipeline)
        .with_context(|| format!("loading pipeline {}", config.pipeline.display()))?;
    for d in pipeline.diagnostics() {
        if d.severity == Severity::Warning {
            tracing::warn!(rule = %d.rule, stage = d.stage_id.as_deref().unwrap_or(""), "{}", d.message);
        }
    }

    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    let admin_password = config.admin_password();
    if admin_password.is_none() {
        tracing::info!("No admin password configured; admin summary disabled");
    }

    let study = Arc::new(Study::new(
        Arc::new(pipeline),
        Arc::new(store),
        config.settings(),
    ));
    spawn_event_logger(&study);

    let app = router(AppState {
        study: study.clone(),
        admin_password,
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(
        pipeline = %study.pipeline().code(),
        stages = study.pipeline().stage_count(),
        "listening on http://{}",
        config.bind
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Forward study events to the log at `debug`.
fn spawn_event_logger(study: &Study) {
    let mut rx = study.events().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(?event, "Study event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
