//! Configuration loading and persistence.
//!
//! Settings live in `<config dir>/config.json`; missing keys take their
//! defaults. Environment variables override the file. The credential is
//! never part of the configuration (see [`crate::credentials`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::client::ClientOptions;
use crate::stomp::{AckMode, HeartBeat};
use crate::supervisor::{
    default_handshake_timeout, ReconnectPolicy, SupervisorSettings, DEFAULT_DESTINATION,
    USER_ID_PLACEHOLDER,
};
use crate::transport::TransportPreference;

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for the notification client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Server endpoint base, e.g. `https://inventory.example.com/ws`.
    pub server_url: String,
    /// STOMP virtual host sent in CONNECT.
    pub host: String,
    /// Destination template; `{user_id}` is replaced by the resolved id.
    pub destination: String,
    /// Subscription acknowledgement mode.
    pub ack_mode: AckMode,
    /// Proposed outgoing heartbeat in milliseconds (0 disables).
    pub heartbeat_outgoing_ms: u64,
    /// Proposed incoming heartbeat in milliseconds (0 disables).
    pub heartbeat_incoming_ms: u64,
    /// Handshake timeout; derived from the heartbeats when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
    /// Delay before each reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// When set above `reconnect_delay_ms`, the delay doubles per failed
    /// attempt up to this cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_delay_ms: Option<u64>,
    /// Seconds between liveness checks.
    pub liveness_interval_secs: u64,
    /// Bound on a single sink invocation.
    pub sink_timeout_ms: u64,
    /// Transport selection.
    pub transport: TransportPreference,
    /// `false` disables the live connection (push delivery only).
    pub live_transport_supported: bool,
    /// Print toast lines.
    pub toast_enabled: bool,
    /// Ring the terminal bell per notification.
    pub sound_enabled: bool,
    /// Emit desktop notifications (OSC 777).
    pub desktop_notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/ws".to_string(),
            host: "localhost".to_string(),
            destination: DEFAULT_DESTINATION.to_string(),
            ack_mode: AckMode::Auto,
            heartbeat_outgoing_ms: 10_000,
            heartbeat_incoming_ms: 10_000,
            handshake_timeout_ms: None,
            reconnect_delay_ms: 3_000,
            reconnect_max_delay_ms: None,
            liveness_interval_secs: 30,
            sink_timeout_ms: 5_000,
            transport: TransportPreference::Auto,
            live_transport_supported: true,
            toast_enabled: true,
            sound_enabled: false,
            desktop_notifications: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `INVNOTIFY_CONFIG_DIR` overrides the platform config directory
    /// (e.g. `~/.config/inventory-notifier`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("INVNOTIFY_CONFIG_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("inventory-notifier"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read `config.json` from `dir`, falling back to defaults when absent.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    /// Apply `INVNOTIFY_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("INVNOTIFY_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(destination) = lookup("INVNOTIFY_DESTINATION") {
            self.destination = destination;
        }

        if let Some(transport) = lookup("INVNOTIFY_TRANSPORT") {
            match transport.parse() {
                Ok(preference) => self.transport = preference,
                Err(e) => log::warn!("Ignoring INVNOTIFY_TRANSPORT: {e}"),
            }
        }

        if let Some(delay) = lookup("INVNOTIFY_RECONNECT_DELAY_MS") {
            if let Ok(ms) = delay.parse::<u64>() {
                self.reconnect_delay_ms = ms;
            }
        }

        if let Some(max_delay) = lookup("INVNOTIFY_RECONNECT_MAX_DELAY_MS") {
            if let Ok(ms) = max_delay.parse::<u64>() {
                self.reconnect_max_delay_ms = Some(ms);
            }
        }

        let flag = |key: &str| lookup(key).and_then(|value| parse_flag(key, &value));
        if let Some(live) = flag("INVNOTIFY_LIVE_TRANSPORT") {
            self.live_transport_supported = live;
        }
        if let Some(sound) = flag("INVNOTIFY_SOUND") {
            self.sound_enabled = sound;
        }
        if let Some(desktop) = flag("INVNOTIFY_DESKTOP") {
            self.desktop_notifications = desktop;
        }
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.server_url.starts_with(scheme));
        anyhow::ensure!(
            scheme_ok,
            "server_url must start with http(s):// or ws(s)://, got '{}'",
            self.server_url
        );
        anyhow::ensure!(
            self.destination.contains(USER_ID_PLACEHOLDER) || self.destination.starts_with("/user/"),
            "destination '{}' must contain {} or start with /user/",
            self.destination,
            USER_ID_PLACEHOLDER
        );
        anyhow::ensure!(
            self.liveness_interval_secs > 0,
            "liveness_interval_secs must be positive"
        );
        anyhow::ensure!(self.sink_timeout_ms > 0, "sink_timeout_ms must be positive");
        Ok(())
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Persist to `dir/config.json`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Proposed heartbeat intervals.
    #[must_use]
    pub fn heartbeat(&self) -> HeartBeat {
        HeartBeat::from_millis(self.heartbeat_outgoing_ms, self.heartbeat_incoming_ms)
    }

    /// Explicit timeout, or twice the longest proposed heartbeat.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_handshake_timeout(self.heartbeat()))
    }

    /// Fixed delay unless a larger cap turns on exponential backoff.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect_max_delay_ms {
            Some(max) if max > self.reconnect_delay_ms => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(max),
            },
            _ => ReconnectPolicy::Fixed(initial),
        }
    }

    /// Period of the liveness check.
    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Bound on a single sink invocation.
    #[must_use]
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    /// Supervisor parameters.
    #[must_use]
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            server_url: self.server_url.clone(),
            host: self.host.clone(),
            destination: self.destination.clone(),
            ack: self.ack_mode,
            heartbeat: self.heartbeat(),
            handshake_timeout: self.handshake_timeout(),
            reconnect: self.reconnect_policy(),
            liveness_interval: self.liveness_interval(),
        }
    }

    /// Client construction options.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            supervisor: self.supervisor_settings(),
            live_transport_supported: self.live_transport_supported,
            sink_timeout: self.sink_timeout(),
            ..ClientOptions::default()
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("Ignoring {key}={other}: expected true/false");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.destination, "/user/queue/notifications");
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Fixed(Duration::from_secs(3)));
        assert_eq!(config.liveness_interval(), Duration::from_secs(30));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"server_url":"https://inventory.example.com/ws","ack_mode":"client-individual"}"#,
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.server_url, "https://inventory.example.com/ws");
        assert_eq!(config.ack_mode, AckMode::ClientIndividual);
        assert_eq!(config.reconnect_delay_ms, 3_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            sound_enabled: true,
            reconnect_max_delay_ms: Some(60_000),
            ..Config::default()
        };
        config.save_to_dir(dir.path()).unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), config);

        #[cfg(unix)]
        {
            let mode = fs::metadata(dir.path().join(CONFIG_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("INVNOTIFY_SERVER_URL", "https://other.example.com/ws"),
            ("INVNOTIFY_TRANSPORT", "polling"),
            ("INVNOTIFY_RECONNECT_DELAY_MS", "1000"),
            ("INVNOTIFY_RECONNECT_MAX_DELAY_MS", "30000"),
            ("INVNOTIFY_LIVE_TRANSPORT", "false"),
            ("INVNOTIFY_SOUND", "on"),
            ("INVNOTIFY_DESKTOP", "maybe"),
        ]));

        assert_eq!(config.server_url, "https://other.example.com/ws");
        assert_eq!(config.transport, TransportPreference::Polling);
        assert!(!config.live_transport_supported);
        assert!(config.sound_enabled);
        assert!(!config.desktop_notifications);
        assert_eq!(
            config.reconnect_policy(),
            ReconnectPolicy::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("INVNOTIFY_TRANSPORT", "carrier-pigeon"),
            ("INVNOTIFY_RECONNECT_DELAY_MS", "soon"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_shared_destination() {
        let config = Config {
            destination: "/topic/everything".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            server_url: "ftp://example.com".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_handshake_timeout() {
        let config = Config {
            handshake_timeout_ms: Some(2_500),
            heartbeat_outgoing_ms: 0,
            heartbeat_incoming_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.handshake_timeout(), Duration::from_millis(2_500));
        assert_eq!(
            Config {
                handshake_timeout_ms: None,
                ..config
            }
            .handshake_timeout(),
            Duration::from_secs(10)
        );
    }
}
