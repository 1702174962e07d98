//! Configuration handling for the mqlink command line client.
//!
//! Settings come from an optional YAML file, then environment variables,
//! then command line flags, each layer overriding the one before.

use anyhow::{Context, Result};
use mqlink_session::{ClientOptions, OfflinePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Client settings shared by every subcommand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Broker address
    pub broker: String,
    /// Client identifier
    pub client_id: String,
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Start with a clean session
    pub clean_session: bool,
    /// Replay subscriptions after a reconnect
    pub resume_subs: bool,
    /// Reconnect when the connection drops
    pub auto_reconnect: bool,
    /// Keep alive interval
    #[serde(with = "humantime_str")]
    pub keep_alive: Duration,
    /// Connect timeout
    #[serde(with = "humantime_str")]
    pub connect_timeout: Duration,
    /// Upper bound on the reconnect backoff
    #[serde(with = "humantime_str")]
    pub max_reconnect_interval: Duration,
    /// Dispatch write timeout; zero waits forever
    #[serde(with = "humantime_str")]
    pub write_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://127.0.0.1:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: true,
            resume_subs: false,
            auto_reconnect: true,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_interval: Duration::from_secs(30),
            write_timeout: Duration::ZERO,
        }
    }
}

mod humantime_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

impl CliConfig {
    /// Load configuration from `config_path` and apply environment overrides.
    ///
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `MQLINK_*` environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(broker) = std::env::var("MQLINK_BROKER") {
            info!("Broker overridden by environment: {}", broker);
            self.broker = broker;
        }

        if let Ok(client_id) = std::env::var("MQLINK_CLIENT_ID") {
            info!("Client id overridden by environment: {}", client_id);
            self.client_id = client_id;
        }

        if let Ok(username) = std::env::var("MQLINK_USERNAME") {
            self.username = Some(username);
        }

        if let Ok(password) = std::env::var("MQLINK_PASSWORD") {
            self.password = Some(password);
        }
    }

    /// Engine options for these settings
    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new(self.broker.clone())
            .with_client_id(self.client_id.clone())
            .with_clean_session(self.clean_session)
            .with_resume_subs(self.resume_subs)
            .with_auto_reconnect(self.auto_reconnect)
            .with_keep_alive(self.keep_alive)
            .with_connect_timeout(self.connect_timeout)
            .with_max_reconnect_interval(self.max_reconnect_interval)
            .with_write_timeout(self.write_timeout);

        if let Some(username) = &self.username {
            options = options.with_credentials(username.clone(), self.password.clone());
        }
        if self.resume_subs && !self.clean_session {
            options = options.with_offline_policy(OfflinePolicy::QueueWhileReconnecting);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.broker, "tcp://127.0.0.1:1883");
        assert!(config.clean_session);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
broker: tcp://broker.local:1883
client_id: sensor-7
clean_session: false
resume_subs: true
keep_alive: 45s
connect_timeout: 2s 500ms
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CliConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.client_id, "sensor-7");
        assert!(!config.clean_session);
        assert_eq!(config.keep_alive, Duration::from_secs(45));
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_reconnect_interval, Duration::from_secs(30));

        let options = config.client_options();
        assert_eq!(options.broker_addr(), "broker.local:1883");
        assert_eq!(options.offline_policy, OfflinePolicy::QueueWhileReconnecting);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.keep_alive, CliConfig::default().keep_alive);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"keep_alive: soon\n").unwrap();
        assert!(CliConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_duration_round_trip() {
        let config = CliConfig {
            keep_alive: Duration::from_secs(90),
            ..CliConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("keep_alive: 1m 30s"));
        assert_eq!(serde_yaml::from_str::<CliConfig>(&yaml).unwrap(), config);
    }
}
