//! Market ingestion service: binary entrypoint.
//! Boots the Axum HTTP server over a shared `IngestionManager` and, when
//! `INGEST_SCHEDULE_SECS` is set, the periodic ingest loop.

use market_ingest::ingest::config::schedule_secs_from_env;
use market_ingest::ingest::scheduler::{spawn_scheduler, IngestSchedulerCfg};
use market_ingest::metrics::Metrics;
use market_ingest::{app_router, build_manager_from_env, AppState};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `LOG_FORMAT=json` switches to structured output; filter via `RUST_LOG`.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Shuttle may already have installed a subscriber.
    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    let _ = dotenvy::dotenv();
    init_tracing();

    let manager = build_manager_from_env()?;

    let metrics = match Metrics::init(manager.gate().capacity()) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus exporter disabled");
            None
        }
    };

    if let Some(secs) = schedule_secs_from_env() {
        tracing::info!(interval_secs = secs, "starting ingest scheduler");
        spawn_scheduler(
            manager.clone(),
            IngestSchedulerCfg {
                interval_secs: secs,
                providers: Vec::new(),
            },
        );
    }

    let router = app_router(AppState { manager }, metrics.as_ref());
    Ok(router.into())
}
