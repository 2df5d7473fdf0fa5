//! Tabscore Worker - Main Entry Point
//!
//! Builds a scorer from configuration, then answers newline-delimited JSON
//! prediction requests read from stdin with one JSON line each on stdout.

use anyhow::Context;
use std::sync::Arc;
use tabscore_common::{ScoringConfig, ScoringError, METRICS};
use tabscore_wire::ErrorResponse;
use tabscore_worker::Scorer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("TABSCORE_CONFIG") {
        Ok(path) => ScoringConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => ScoringConfig::from_env().context("failed to load config from environment")?,
    };

    // Initialize logging; stdout carries responses only
    let structured = config.observability.structured_logging;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_level.as_str().into()),
        )
        .with(structured.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!structured).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    info!("Starting Tabscore Worker");

    let scorer = Arc::new(Scorer::new(&config)?);
    scorer.warm_up()?;
    info!(model = %config.model.model_file, "Model ready");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = serve(Arc::clone(&scorer)) => {
            result?;
        }
    }

    if config.observability.enable_metrics {
        debug!(metrics = %METRICS.gather(), "Final metrics");
    }
    info!("Tabscore Worker shutdown complete");
    Ok(())
}

/// Answer requests until stdin closes
async fn serve(scorer: Arc<Scorer>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let scorer = Arc::clone(&scorer);
        let response = tokio::task::spawn_blocking(move || {
            let body = serde_json::from_str(&line).map_err(ScoringError::from)?;
            scorer.predict(body)
        })
        .await?;

        let mut out = match response {
            Ok(response) => serde_json::to_vec(&response)?,
            Err(e) => {
                error!(error = %e, "Prediction failed");
                serde_json::to_vec(&ErrorResponse {
                    error: e.to_string(),
                    status: e.status_code(),
                })?
            }
        };
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}
