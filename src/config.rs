use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::DEFAULT_SERVICE_PREFIX;
use crate::server::UnknownMethodPolicy;
use crate::transport::{Backoff, FrameCodec, Reconnect};

/// Default relay socket; `$UID` and `$RUNTIME_DIRECTORY` are expanded
pub const DEFAULT_SOCKET_PATH: &str = "/run/user/$UID/playbridge/relay.sock";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Unix socket the relay listens on and the other side dials
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Dial this TCP address from the relay instead of listening on the socket
    #[serde(default)]
    pub tcp_address: Option<String>,

    /// Prefix on fully qualified method names
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,

    /// Largest frame payload accepted, in bytes. Unlimited if unset.
    #[serde(default)]
    pub max_frame_length: Option<usize>,

    /// Base reconnect delay in milliseconds
    #[serde(default = "default_reconnect_step_ms")]
    pub reconnect_step_ms: u64,

    /// Give up after this many consecutive failed connection attempts.
    /// Retries forever if unset.
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,

    #[serde(default)]
    pub unknown_methods: UnknownMethodPolicy,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_service_prefix() -> String {
    DEFAULT_SERVICE_PREFIX.to_string()
}

fn default_reconnect_step_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            tcp_address: None,
            service_prefix: default_service_prefix(),
            max_frame_length: None,
            reconnect_step_ms: default_reconnect_step_ms(),
            max_connect_attempts: None,
            unknown_methods: UnknownMethodPolicy::default(),
        }
    }
}

impl Settings {
    /// Load config from ~/.config/playbridge/config.toml
    /// Returns default settings if the file doesn't exist or fails to parse
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            log::warn!("Could not determine config directory, using defaults");
            return Self::default();
        };

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file found at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", path.display()));
            }
        };

        let settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!("Loaded settings from: {}", path.display());
        Ok(settings)
    }

    /// Socket path with `$UID` and `$RUNTIME_DIRECTORY` expanded
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(expand_socket_path(&self.socket_path))
    }

    pub fn frame_codec(&self) -> FrameCodec {
        match self.max_frame_length {
            Some(max) => FrameCodec::with_max_frame_length(max),
            None => FrameCodec::new(),
        }
    }

    pub fn reconnect(&self) -> Reconnect {
        let retry = Reconnect::new(Backoff::new(Duration::from_millis(self.reconnect_step_ms)));
        match self.max_connect_attempts {
            Some(attempts) => retry.with_max_attempts(attempts),
            None => retry,
        }
    }
}

/// Get the path to the config file: ~/.config/playbridge/config.toml
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "playbridge").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn get_uid() -> String {
    std::env::var("UID").unwrap_or_else(|_| {
        // Fallback: use nix to get actual UID
        nix::unistd::getuid().to_string()
    })
}

pub fn expand_socket_path(path: &str) -> String {
    let expanded = path.replace("$UID", &get_uid());

    // Support $RUNTIME_DIRECTORY for systemd RuntimeDirectory=
    if let Ok(runtime_dir) = std::env::var("RUNTIME_DIRECTORY") {
        expanded.replace("$RUNTIME_DIRECTORY", &runtime_dir)
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(settings.service_prefix, "/YtMusic/");
        assert_eq!(settings.unknown_methods, UnknownMethodPolicy::Ignore);
        assert_eq!(settings.frame_codec().max_frame_length(), None);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "socket_path = \"/tmp/bridge.sock\"\nmax_frame_length = 65536\nunknown_methods = \"reject\"\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.socket_path(), PathBuf::from("/tmp/bridge.sock"));
        assert_eq!(settings.frame_codec().max_frame_length(), Some(65536));
        assert_eq!(settings.unknown_methods, UnknownMethodPolicy::Reject);
        assert_eq!(settings.reconnect_step_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_default_and_bad_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing, Settings::default());

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "reconnect_step_ms = \"soon\"").unwrap();
        assert!(Settings::load_from(&bad).is_err());
    }

    #[test]
    fn test_uid_is_expanded() {
        let expanded = expand_socket_path(DEFAULT_SOCKET_PATH);
        assert!(!expanded.contains("$UID"));
        assert!(expanded.ends_with("/playbridge/relay.sock"));
    }
}
