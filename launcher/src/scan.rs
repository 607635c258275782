//! Recognising the listening-address announcement in diagnostic output.

use regex::Regex;
use url::Url;

use crate::error::LaunchError;

const LISTEN_FAILURE: &str = "Cannot start http server for devtools.";

const ACCEPTED_SCHEMES: [&str; 2] = ["ws", "wss"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    Continue,
    Announced(String),
}

/// Line-by-line scanner with a bound on how much output it will look at.
pub(crate) struct AnnouncementScanner {
    announcement: Regex,
    scanned: usize,
    limit: usize,
}

impl AnnouncementScanner {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            announcement: Regex::new(r"^DevTools listening on (\S+)")
                .expect("valid announcement regex"),
            scanned: 0,
            limit,
        }
    }

    /// Bytes left before the scan gives up.
    pub(crate) fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.scanned)
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Scan one raw line. Invalid UTF-8 is replaced, not rejected.
    pub(crate) fn feed(&mut self, raw: &[u8]) -> Result<LineOutcome, LaunchError> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\r', '\n']);
        if let Some(captures) = self.announcement.captures(line) {
            return Ok(LineOutcome::Announced(captures[1].to_string()));
        }
        if line.trim() == LISTEN_FAILURE {
            return Err(LaunchError::ListenFailure);
        }

        self.scanned += raw.len();
        if self.scanned > self.limit {
            return Err(LaunchError::BufferOverflow { limit: self.limit });
        }
        Ok(LineOutcome::Continue)
    }
}

/// Parse an announced address and check it against the requested port.
pub(crate) fn validate_address(raw: &str, requested_port: u16) -> Result<Url, LaunchError> {
    let address = Url::parse(raw).map_err(|e| LaunchError::AddressParse {
        address: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !ACCEPTED_SCHEMES.contains(&address.scheme()) {
        return Err(LaunchError::ProtocolMismatch {
            scheme: address.scheme().to_string(),
        });
    }
    // `port()` is `None` when the announced port is the scheme default.
    let announced = address.port_or_known_default();
    if announced != Some(requested_port) {
        return Err(LaunchError::PortMismatch {
            requested: requested_port,
            announced,
        });
    }
    Ok(address)
}
