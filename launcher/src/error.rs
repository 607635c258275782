use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a launch failed. The process has already been killed when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to allocate a debugging port: {0}")]
    PortAllocation(#[source] std::io::Error),
    #[error("no listening address announced within {}ms", timeout.as_millis())]
    StartupTimeout { timeout: Duration },
    #[error("scanned {limit} bytes of diagnostic output without finding an address")]
    BufferOverflow { limit: usize },
    #[error("process could not start its debugging server")]
    ListenFailure,
    #[error("invalid listening address {address:?}: {reason}")]
    AddressParse { address: String, reason: String },
    #[error("unexpected scheme {scheme:?} in listening address")]
    ProtocolMismatch { scheme: String },
    #[error("announced port {announced:?} does not match requested port {requested}")]
    PortMismatch {
        requested: u16,
        announced: Option<u16>,
    },
    #[error("process exited before announcing an address (exit code {code:?})")]
    PrematureExit { code: Option<i32> },
    #[error("failed to read diagnostic output: {0}")]
    Diagnostics(#[source] std::io::Error),
}
