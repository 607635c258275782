//! Configuration file loading.
//!
//! ```toml
//! [bridge]
//! poll_timeout_ms = 30000
//! release_timeout_ms = 2000
//!
//! [launcher]
//! binary_path = "/usr/bin/chromium"
//! extra_args = ["--headless=new"]
//! data_dir = "${HOME}/.cache/tether-profile"
//! fixed_port = 9222
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use tether_bridge::BridgeOptions;
use tether_launcher::LaunchConfig;
use thiserror::Error;

/// Overrides the default config location.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    pub bridge: Option<BridgeSection>,
    pub launcher: Option<LauncherSection>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    pub poll_timeout_ms: Option<u64>,
    pub release_timeout_ms: Option<u64>,
}

impl BridgeSection {
    /// Bridge options with unset values left at their defaults.
    #[must_use]
    pub fn options(&self) -> BridgeOptions {
        let mut options = BridgeOptions::default();
        if let Some(ms) = self.poll_timeout_ms {
            options = options.with_poll_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.release_timeout_ms {
            options = options.with_release_timeout(Duration::from_millis(ms));
        }
        options
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherSection {
    pub binary_path: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub data_dir: Option<String>,
    pub fixed_port: Option<u16>,
    pub startup_timeout_ms: Option<u64>,
    pub scan_buffer_bytes: Option<usize>,
}

impl LauncherSection {
    /// Build a launch configuration. Returns `None` when no binary is
    /// configured. String values have `${VAR}` references expanded.
    #[must_use]
    pub fn launch_config(&self) -> Option<LaunchConfig> {
        let binary = expand_env_vars(self.binary_path.as_deref()?);
        let data_dir = self
            .data_dir
            .as_deref()
            .map_or_else(default_data_dir, |dir| PathBuf::from(expand_env_vars(dir)));

        let mut config = LaunchConfig::new(binary, data_dir)
            .with_args(self.extra_args.iter().map(|arg| expand_env_vars(arg)));
        if let Some(port) = self.fixed_port {
            config = config.with_fixed_port(port);
        }
        if let Some(ms) = self.startup_timeout_ms {
            config = config.with_startup_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = self.scan_buffer_bytes {
            config = config.with_scan_buffer_bytes(bytes);
        }
        Some(config)
    }
}

/// Profile directory used when none is configured.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    env::temp_dir().join("tether-profile")
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to an
/// empty string and an unterminated `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + len];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

impl TetherConfig {
    /// Load from the default location. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!("no config at {}", path.display());
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn bridge_options(&self) -> BridgeOptions {
        self.bridge
            .as_ref()
            .map(BridgeSection::options)
            .unwrap_or_default()
    }
}

/// `$TETHER_CONFIG` if set, else `~/.tether/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn expand_env_vars_without_references() {
        assert_eq!(expand_env_vars("plain/path"), "plain/path");
    }

    #[test]
    fn expand_env_vars_replaces_set_and_unset() {
        unsafe {
            env::set_var("TETHER_TEST_EXPAND_A", "alpha");
            env::remove_var("TETHER_TEST_EXPAND_MISSING");
        }
        assert_eq!(
            expand_env_vars("${TETHER_TEST_EXPAND_A}/x/${TETHER_TEST_EXPAND_MISSING}/y"),
            "alpha/x//y"
        );
        unsafe {
            env::remove_var("TETHER_TEST_EXPAND_A");
        }
    }

    #[test]
    fn expand_env_vars_keeps_unterminated_reference() {
        assert_eq!(expand_env_vars("a ${NOPE"), "a ${NOPE");
        assert_eq!(expand_env_vars("${}x"), "x");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let (_dir, path) = write_config("");
        let config = TetherConfig::load_from(&path).unwrap();
        let options = config.bridge_options();
        assert_eq!(options.poll_timeout, BridgeOptions::default().poll_timeout);
        assert_eq!(
            options.release_timeout,
            BridgeOptions::default().release_timeout
        );
        assert!(config.launcher.is_none());
    }

    #[test]
    fn bridge_section_overrides_timeouts() {
        let (_dir, path) = write_config("[bridge]\npoll_timeout_ms = 1500\n");
        let options = TetherConfig::load_from(&path).unwrap().bridge_options();
        assert_eq!(options.poll_timeout, Duration::from_millis(1500));
        assert_eq!(
            options.release_timeout,
            BridgeOptions::default().release_timeout
        );
    }

    #[test]
    fn launcher_section_builds_launch_config() {
        let (_dir, path) = write_config(
            r#"
[launcher]
binary_path = "/usr/bin/chromium"
extra_args = ["--headless=new", "--mute-audio"]
data_dir = "/tmp/profile"
fixed_port = 9222
startup_timeout_ms = 5000
scan_buffer_bytes = 4096
"#,
        );
        let config = TetherConfig::load_from(&path).unwrap();
        let launch = config
            .launcher
            .as_ref()
            .and_then(LauncherSection::launch_config)
            .unwrap();

        assert_eq!(launch.binary_path, PathBuf::from("/usr/bin/chromium"));
        assert_eq!(launch.extra_args, vec!["--headless=new", "--mute-audio"]);
        assert_eq!(launch.data_dir, PathBuf::from("/tmp/profile"));
        assert_eq!(launch.fixed_port, Some(9222));
        assert_eq!(launch.startup_timeout, Duration::from_secs(5));
        assert_eq!(launch.scan_buffer_bytes, 4096);
    }

    #[test]
    fn launcher_without_binary_has_no_launch_config() {
        let section = LauncherSection {
            fixed_port: Some(9222),
            ..LauncherSection::default()
        };
        assert!(section.launch_config().is_none());
    }

    #[test]
    fn launcher_defaults_data_dir() {
        let section = LauncherSection {
            binary_path: Some("chromium".to_string()),
            ..LauncherSection::default()
        };
        let launch = section.launch_config().unwrap();
        assert_eq!(launch.data_dir, default_data_dir());
        assert_eq!(launch.fixed_port, None);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let (_dir, path) = write_config("[bridge\npoll_timeout_ms = 1");
        let err = TetherConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_dir, path) = write_config("[bridge]\npoll_timeout = 10\n");
        assert!(matches!(
            TetherConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            TetherConfig::load_from(&path),
            Err(ConfigError::Read { .. })
        ));
    }
}
