use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use url::Url;

use crate::error::LaunchError;
use crate::scan::{AnnouncementScanner, LineOutcome, validate_address};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCAN_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub binary_path: PathBuf,
    /// Passed before the debugging flags the launcher adds itself.
    pub extra_args: Vec<String>,
    pub data_dir: PathBuf,
    /// Debugging port to request. A free port is picked when unset.
    pub fixed_port: Option<u16>,
    pub startup_timeout: Duration,
    /// Stop scanning stderr after this many bytes without an announcement.
    pub scan_buffer_bytes: usize,
}

impl LaunchConfig {
    pub fn new(binary_path: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            extra_args: Vec::new(),
            data_dir: data_dir.into(),
            fixed_port: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            scan_buffer_bytes: DEFAULT_SCAN_BUFFER_BYTES,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_fixed_port(mut self, port: u16) -> Self {
        self.fixed_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_scan_buffer_bytes(mut self, bytes: usize) -> Self {
        self.scan_buffer_bytes = bytes;
        self
    }
}

/// A running process whose debugging endpoint has been announced.
#[derive(Debug)]
pub struct LaunchedProcess {
    child: Child,
    port: u16,
    address: Url,
}

impl LaunchedProcess {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub async fn kill(mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Spawn the configured binary and wait for its listening address.
pub async fn launch(config: &LaunchConfig) -> Result<LaunchedProcess, LaunchError> {
    let port = match config.fixed_port {
        Some(port) => port,
        None => allocate_port()?,
    };

    let mut command = Command::new(&config.binary_path);
    command
        .args(&config.extra_args)
        .arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", config.data_dir.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(
        binary = %config.binary_path.display(),
        port,
        "launching process"
    );
    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        path: config.binary_path.clone(),
        source,
    })?;

    let outcome = match child.stderr.take() {
        Some(stderr) => tokio::time::timeout(
            config.startup_timeout,
            wait_for_address(&mut child, stderr, config.scan_buffer_bytes, port),
        )
        .await
        .unwrap_or(Err(LaunchError::StartupTimeout {
            timeout: config.startup_timeout,
        })),
        None => Err(LaunchError::Diagnostics(std::io::Error::other(
            "child has no stderr",
        ))),
    };

    match outcome {
        Ok((address, stderr)) => {
            tracing::info!(%address, port, "process is listening");
            tokio::spawn(drain_diagnostics(stderr));
            Ok(LaunchedProcess {
                child,
                port,
                address,
            })
        }
        Err(e) => {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!("failed to kill launched process: {kill_err}");
            }
            tracing::warn!("launch failed: {e}");
            Err(e)
        }
    }
}

fn allocate_port() -> Result<u16, LaunchError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(LaunchError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(LaunchError::PortAllocation)?
        .port();
    Ok(port)
}

async fn wait_for_address(
    child: &mut Child,
    stderr: ChildStderr,
    scan_limit: usize,
    port: u16,
) -> Result<(Url, BufReader<ChildStderr>), LaunchError> {
    let mut reader = BufReader::new(stderr);
    let mut scanner = AnnouncementScanner::new(scan_limit);
    let mut line = Vec::new();

    loop {
        line.clear();
        // One byte past the budget, so a line that overruns it is detected
        // without buffering the rest of it.
        let cap = scanner.remaining() + 1;
        let read = (&mut reader)
            .take(cap as u64)
            .read_until(b'\n', &mut line)
            .await
            .map_err(LaunchError::Diagnostics)?;
        if read == 0 {
            let code = child.wait().await.ok().and_then(|status| status.code());
            return Err(LaunchError::PrematureExit { code });
        }
        if read == cap && line.last() != Some(&b'\n') {
            return Err(LaunchError::BufferOverflow {
                limit: scanner.limit(),
            });
        }

        match scanner.feed(&line)? {
            LineOutcome::Continue => {}
            LineOutcome::Announced(raw) => {
                let address = validate_address(&raw, port)?;
                return Ok((address, reader));
            }
        }
    }
}

/// Keep reading stderr after the announcement so the child never blocks on
/// a full pipe.
async fn drain_diagnostics(mut stderr: BufReader<ChildStderr>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match stderr.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => tracing::trace!(
                target: "tether_launcher::stderr",
                "{}",
                String::from_utf8_lossy(&line).trim_end()
            ),
        }
    }
}
