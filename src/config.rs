use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file path.
pub const CONFIG_FILE: &str = "/etc/craftnap/config.yaml";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Configuration is semantically invalid.
    #[error("{0}")]
    Invalid(String),

    /// The API token environment variable is not set.
    #[error("environment variable '{0}' is not set or empty, it must contain a Crafty API token")]
    MissingToken(String),
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Crafty Controller connection settings.
    #[serde(default)]
    pub crafty: Crafty,

    /// Managed servers by name.
    ///
    /// A `BTreeMap` so iteration order is deterministic.
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,

    /// Polling settings.
    #[serde(default)]
    pub polling: Polling,

    /// Hysteresis and anti-flap settings.
    #[serde(default)]
    pub cooldowns: Cooldowns,

    /// Webhook notification settings.
    #[serde(default)]
    pub webhook: Webhook,

    /// Logging settings.
    #[serde(default)]
    pub logging: Logging,

    /// Health/status HTTP endpoint settings.
    #[serde(default)]
    pub health: Health,
}

impl Config {
    /// Load and validate configuration from the given file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        config.crafty.resolve_token()?;

        Ok(config)
    }

    /// Validate semantic constraints the schema cannot express.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server must be defined under 'servers:'".into(),
            ));
        }

        let mut seen_ports: BTreeMap<u16, &str> = BTreeMap::new();
        for (name, server) in &self.servers {
            if server.crafty_server_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': 'crafty_server_id' is required",
                    name
                )));
            }
            if server.listen_host.parse::<IpAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': listen_host '{}' is not a valid IP address",
                    name, server.listen_host
                )));
            }
            if let Some(other) = seen_ports.insert(server.listen_port, name) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' and '{}' both use port {}",
                    name, other, server.listen_port
                )));
            }
        }

        if self.webhook.enabled && self.webhook.url.is_empty() {
            return Err(ConfigError::Invalid(
                "webhook.enabled is true but webhook.url is not set".into(),
            ));
        }

        Ok(())
    }
}

/// Crafty Controller connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Crafty {
    /// Base URL including scheme and port.
    pub base_url: String,

    /// Name of the environment variable holding the API token.
    pub api_token_env: String,

    /// Whether to verify the controller TLS certificate.
    pub verify_tls: bool,

    /// Resolved API token, never read from the YAML itself.
    #[serde(skip)]
    pub api_token: String,
}

impl Crafty {
    /// Read the API token from the configured environment variable.
    fn resolve_token(&mut self) -> Result<(), ConfigError> {
        match env::var(&self.api_token_env) {
            Ok(token) if !token.is_empty() => {
                self.api_token = token;
                Ok(())
            }
            _ => Err(ConfigError::MissingToken(self.api_token_env.clone())),
        }
    }
}

impl Default for Crafty {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8443".into(),
            api_token_env: "CRAFTY_API_TOKEN".into(),
            verify_tls: true,
            api_token: String::new(),
        }
    }
}

/// Game server edition.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Java Edition, TCP.
    Java,

    /// Bedrock Edition, UDP/RakNet.
    Bedrock,
}

impl Edition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Bedrock => "bedrock",
        }
    }
}

/// Per-server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    /// Server ID known to the Crafty Controller.
    pub crafty_server_id: String,

    /// Port the impersonator listens on while the server sleeps.
    pub listen_port: u16,

    /// Address the impersonator binds to.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Game edition, selects the impersonator protocol.
    #[serde(default = "default_edition")]
    pub edition: Edition,

    /// Minutes without players before the server is asked to stop.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,

    /// Seconds to wait for a starting server before giving up.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,

    /// MOTD shown to pinging clients while hibernating.
    #[serde(default = "default_motd")]
    pub motd_hibernating: String,

    /// Message shown to a login attempt that triggers a wake-up.
    #[serde(default = "default_kick")]
    pub kick_message: String,
}

impl Server {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".into()
}

fn default_edition() -> Edition {
    Edition::Java
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    180
}

fn default_motd() -> String {
    "§7⏳ Server is hibernating. Connect to wake it up!".into()
}

fn default_kick() -> String {
    "§eServer is starting up!\n§7Please reconnect in about 60 seconds.".into()
}

/// Polling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Polling {
    /// Seconds between orchestrator ticks.
    pub interval_seconds: u64,

    /// Seconds to sleep after a transport failure before the next attempt.
    pub api_retry_delay_seconds: u64,

    /// Consecutive transport failures before logging at error level.
    pub api_max_retries: u32,
}

impl Polling {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn api_retry_delay(&self) -> Duration {
        Duration::from_secs(self.api_retry_delay_seconds)
    }
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            api_retry_delay_seconds: 10,
            api_max_retries: 3,
        }
    }
}

/// Hysteresis and anti-flap settings.
#[derive(Debug, Copy, Clone, Deserialize)]
#[serde(default)]
pub struct Cooldowns {
    /// Minutes after a stop during which no further stop is issued.
    pub stop_cooldown_minutes: u64,

    /// Minutes after a start during which the idle timer is suppressed.
    pub start_grace_minutes: u64,

    /// Minutes of history considered for flap detection.
    pub flap_window_minutes: u64,

    /// Start/stop cycles within the window that count as flapping.
    pub flap_max_cycles: u32,

    /// Minutes to back off once flapping is detected.
    pub flap_backoff_minutes: u64,
}

impl Cooldowns {
    pub fn stop_cooldown(&self) -> Duration {
        Duration::from_secs(self.stop_cooldown_minutes * 60)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_minutes * 60)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_minutes * 60)
    }

    pub fn flap_backoff(&self) -> Duration {
        Duration::from_secs(self.flap_backoff_minutes * 60)
    }
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            stop_cooldown_minutes: 5,
            start_grace_minutes: 3,
            flap_window_minutes: 30,
            flap_max_cycles: 3,
            flap_backoff_minutes: 10,
        }
    }
}

/// Webhook notification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Webhook {
    pub enabled: bool,
    pub url: String,
    pub label: String,
}

impl Default for Webhook {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            label: "craftnap".into(),
        }
    }
}

/// Logging settings.
///
/// Rotation values are accepted for compatibility with supervised
/// deployments, the logger itself writes to stderr and leaves rotation
/// to the supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub file: String,
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: "/var/log/craftnap/service.log".into(),
            max_bytes: 10 * 1024 * 1024,
            backup_count: 5,
        }
    }
}

/// Health/status HTTP endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Health {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8095,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
servers:
  survival:
    crafty_server_id: "abc-123"
    listen_port: 25565
"#
    }

    #[test]
    fn parse_minimal_with_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();

        let server = &config.servers["survival"];
        assert_eq!(server.crafty_server_id, "abc-123");
        assert_eq!(server.listen_port, 25565);
        assert_eq!(server.listen_host, "0.0.0.0");
        assert_eq!(server.edition, Edition::Java);
        assert_eq!(server.idle_timeout(), Duration::from_secs(600));
        assert_eq!(server.start_timeout(), Duration::from_secs(180));

        assert_eq!(config.polling.interval_seconds, 30);
        assert_eq!(config.cooldowns.stop_cooldown_minutes, 5);
        assert_eq!(config.cooldowns.flap_max_cycles, 3);
        assert!(config.health.enabled);
        assert!(!config.webhook.enabled);
    }

    #[test]
    fn parse_bedrock_edition() {
        let yaml = r#"
servers:
  bedrock:
    crafty_server_id: "id"
    listen_port: 19132
    edition: bedrock
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers["bedrock"].edition, Edition::Bedrock);
    }

    #[test]
    fn reject_unknown_edition() {
        let yaml = r#"
servers:
  oops:
    crafty_server_id: "id"
    listen_port: 25565
    edition: pocket
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn reject_empty_server_list() {
        let config: Config = serde_yaml::from_str("servers: {}").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reject_duplicate_ports() {
        let yaml = r#"
servers:
  one:
    crafty_server_id: "a"
    listen_port: 25565
  two:
    crafty_server_id: "b"
    listen_port: 25565
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("both use port 25565"));
    }

    #[test]
    fn reject_bad_listen_host() {
        let yaml = r#"
servers:
  one:
    crafty_server_id: "a"
    listen_port: 25565
    listen_host: "not-an-ip"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn token_resolution() {
        let mut crafty = Crafty {
            api_token_env: "CRAFTNAP_TEST_TOKEN".into(),
            ..Default::default()
        };
        env::set_var("CRAFTNAP_TEST_TOKEN", "secret");
        crafty.resolve_token().unwrap();
        assert_eq!(crafty.api_token, "secret");

        env::remove_var("CRAFTNAP_TEST_TOKEN");
        let mut crafty = Crafty {
            api_token_env: "CRAFTNAP_TEST_TOKEN".into(),
            ..Default::default()
        };
        assert!(matches!(
            crafty.resolve_token(),
            Err(ConfigError::MissingToken(_))
        ));
    }

    #[test]
    fn webhook_requires_url() {
        let yaml = r#"
servers:
  one:
    crafty_server_id: "a"
    listen_port: 25565
webhook:
  enabled: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
