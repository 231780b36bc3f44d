mod conferencing;
mod config;
mod runtime;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

use coach_metrics::{MetricsConfig, MetricsServer};
use config::Config;
use conferencing::UnlinkedConferencingClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();

    let default_level = if cfg.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let ms = MetricsServer::install(MetricsConfig {
        listen: cfg.metrics_listen.clone(),
        namespace: "coach",
    })?;
    tokio::spawn(async move {
        let _ = ms.serve().await;
    });

    // A deployment links its concrete conferencing SDK adapter here;
    // the core pipeline itself is exercised purely against the
    // `ConferencingClient` trait (spec §6).
    let conferencing: Arc<dyn conferencing::ConferencingClient> = Arc::new(UnlinkedConferencingClient);

    let exit_code = match runtime::run(cfg, conferencing).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error during session run");
            1
        }
    };

    std::process::exit(exit_code);
}
