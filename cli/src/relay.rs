use anyhow::{Context, Result};
use serde_json::Value;
use tether_bridge::{BridgeController, BridgeNotification, BridgeOptions, RpcHandle};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Host side: bridge the spawned program's queue and print every event.
pub async fn run(program: &[String], options: BridgeOptions) -> Result<()> {
    let (binary, args) = program.split_first().context("no program given")?;
    let mut command = Command::new(binary);
    command.args(args);

    let handle = RpcHandle::<Value>::spawn(command)
        .with_context(|| format!("failed to spawn {binary}"))?;
    let (bridge, mut notifications) = BridgeController::start_with_channel(handle, options);
    let mut stdout = tokio::io::stdout();
    let mut interrupted = false;

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(BridgeNotification::Event(event)) => {
                    let mut line = serde_json::to_vec(&event)?;
                    line.push(b'\n');
                    stdout.write_all(&line).await.context("failed to write event")?;
                    stdout.flush().await.context("failed to write event")?;
                }
                Some(BridgeNotification::Disposed) | None => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                tracing::info!("interrupted, disposing bridge");
                bridge.dispose().await;
            }
        }
    }

    tracing::info!(interrupted, "bridge disposed");
    Ok(())
}
