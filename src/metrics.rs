use std::sync::Arc;

use anyhow::Context;
use axum::{http::header, response::IntoResponse, routing::get, Router};
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::ingest::IngestionManager;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Prometheus recorder plus the `/metrics` scrape route.
#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide recorder. Fails if one is already installed.
    pub fn init(gate_capacity: usize) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        describe_gauge!("ingest_gate_capacity", "Size of the global ingestion semaphore.");
        describe_gauge!("ingest_providers_enabled", "Registered providers currently enabled.");
        describe_gauge!("ingest_providers_disabled", "Registered providers currently disabled.");
        gauge!("ingest_gate_capacity").set(gate_capacity as f64);

        Ok(Self { handle })
    }

    /// Refresh point-in-time gauges from the manager, then render.
    pub fn scrape(&self, manager: &IngestionManager) -> String {
        let statuses = manager.registry().list();
        let enabled = statuses.iter().filter(|s| s.enabled).count();
        gauge!("ingest_providers_enabled").set(enabled as f64);
        gauge!("ingest_providers_disabled").set((statuses.len() - enabled) as f64);
        gauge!("ingest_gate_active").set(manager.gate().active() as f64);
        self.handle.render()
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self, manager: Arc<IngestionManager>) -> Router {
        let this = self.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let body = this.scrape(&manager);
                async move {
                    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
                }
            }),
        )
    }
}
