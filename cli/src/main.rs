use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tether_config::{LauncherSection, TetherConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod emit;
mod launch;
mod relay;

/// Long-poll event bridge between a host and a remote event queue
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (overrides $TETHER_CONFIG and ~/.tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an event queue on stdin/stdout and post tick events to it
    Emit {
        /// Number of ticks to post; unbounded when omitted
        #[arg(long)]
        count: Option<u64>,
        /// Delay between ticks
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Spawn a remote program and print its events as JSON lines
    Relay {
        /// Long-poll window
        #[arg(long)]
        poll_timeout_ms: Option<u64>,
        /// Program to spawn, followed by its arguments
        #[arg(last = true, required = true)]
        program: Vec<String>,
    },
    /// Launch a browser with remote debugging and print its address
    Launch {
        /// Browser binary
        #[arg(long)]
        binary: Option<PathBuf>,
        /// Debugging port; a free one is picked when omitted
        #[arg(long)]
        port: Option<u16>,
        /// Profile directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Extra arguments passed before the debugging flags
        #[arg(last = true)]
        extra_args: Vec<String>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries event output and, for `emit`, the wire protocol.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<TetherConfig> {
    match path {
        Some(path) => TetherConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(TetherConfig::load()?.unwrap_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Emit { count, interval_ms } => {
            emit::run(count, Duration::from_millis(interval_ms)).await
        }
        Commands::Relay {
            poll_timeout_ms,
            program,
        } => {
            let mut options = config.bridge_options();
            if let Some(ms) = poll_timeout_ms {
                options = options.with_poll_timeout(Duration::from_millis(ms));
            }
            relay::run(&program, options).await
        }
        Commands::Launch {
            binary,
            port,
            data_dir,
            extra_args,
        } => {
            let section = config.launcher.unwrap_or_default();
            let section = LauncherSection {
                binary_path: binary
                    .map(|path| path.display().to_string())
                    .or(section.binary_path),
                data_dir: data_dir
                    .map(|dir| dir.display().to_string())
                    .or(section.data_dir),
                fixed_port: port.or(section.fixed_port),
                extra_args: if extra_args.is_empty() {
                    section.extra_args
                } else {
                    extra_args
                },
                ..section
            };
            let Some(launch_config) = section.launch_config() else {
                bail!("no browser binary given; pass --binary or set [launcher] binary_path");
            };
            launch::run(&launch_config).await
        }
    }
}
