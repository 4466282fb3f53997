//! Run command implementation

use crate::auth::{AngelAuthenticator, Credentials};
use crate::config::{Config, StorageBackend};
use crate::ingest::{open_store, Ingestor};
use crate::telemetry::{spawn_server, HealthState, PipelineMetrics, TelemetryGuard};
use crate::ws::TungsteniteTransport;
use anyhow::Context;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep ticks in memory instead of the configured store
    #[arg(long)]
    pub memory_store: bool,
}

impl RunArgs {
    pub async fn execute(&self, mut config: Config, telemetry: TelemetryGuard) -> anyhow::Result<()> {
        if self.memory_store {
            config.storage.backend = StorageBackend::Memory;
        }

        let credentials = Credentials::from_env().context("reading ANGEL_* credentials")?;
        let client_code = credentials.client_code.clone();
        let api_key = credentials.api_key.clone();
        let authenticator = AngelAuthenticator::new(
            config.auth.login_url.clone(),
            Duration::from_secs(config.auth.timeout_secs),
            credentials,
        )?;

        let store = open_store(&config.storage).context("opening tick store")?;
        let metrics = Arc::new(PipelineMetrics::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        let ingest = Ingestor::new(
            config,
            Arc::new(authenticator),
            Arc::new(TungsteniteTransport),
            store,
            metrics.clone(),
        )
        .with_client(client_code, api_key);

        if let Some(addr) = telemetry.metrics_addr {
            let mut state = HealthState::new(metrics, ingest.breaker().clone());
            if let Some(handle) = telemetry.prometheus {
                state = state.with_prometheus(handle);
            }
            spawn_server(addr, state, shutdown_rx.clone())
                .await
                .with_context(|| format!("binding health endpoint on {}", addr))?;
        }

        ingest.run(shutdown_rx).await?;

        Ok(())
    }
}
