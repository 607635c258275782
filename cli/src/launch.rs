use anyhow::{Context, Result};
use serde_json::json;
use tether_launcher::{LaunchConfig, launch};

pub async fn run(config: &LaunchConfig) -> Result<()> {
    let process = launch(config)
        .await
        .with_context(|| format!("failed to launch {}", config.binary_path.display()))?;

    println!(
        "{}",
        json!({ "port": process.port(), "address": process.address().as_str() })
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("interrupted, stopping browser");
    process.kill().await.context("failed to kill browser")?;
    Ok(())
}
