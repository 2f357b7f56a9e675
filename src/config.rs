//! Configuration surface consumed by the core.
//!
//! The core never reads or writes this from disk — that is the sidecar's
//! job (see the out-of-scope line in the top-level design). What lives here
//! is the typed shape of the JSON document the sidecar hands in, plus
//! validation the supervisor runs before it will start.

use serde::{Deserialize, Serialize};

fn default_remote_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_keepalive_interval_seconds() -> u64 {
    30
}

fn default_keepalive_max_missed() -> u32 {
    3
}

fn default_max_delay_seconds() -> f64 {
    300.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay_seconds() -> f64 {
    1.0
}

/// SSH server connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
}

fn default_port() -> u16 {
    22
}

/// Private key authentication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyConfig {
    pub path: String,
    /// Whether the sidecar should fetch the passphrase from a keyring before
    /// calling `Supervisor::start`. The core neither reads nor writes a
    /// keyring; this flag only tells the embedder what to do before handing
    /// the passphrase over.
    #[serde(default)]
    pub passphrase_in_keyring: bool,
}

/// One remote-port forwarding policy.
///
/// `remote_port` is the key under which `ForwardRegistry` tracks state; two
/// enabled rules sharing a `remote_port` is a configuration error, not a
/// runtime one (caught by `Config::validate`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default = "default_remote_bind_address")]
    pub remote_bind_address: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

impl ForwardRule {
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            remote_bind_address: default_remote_bind_address(),
            enabled: true,
            description: String::new(),
        }
    }
}

/// Auto-reconnect settings for the Supervisor's backoff loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0 means unbounded retries.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            initial_delay_seconds: default_initial_delay_seconds(),
            max_delay_seconds: default_max_delay_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Connection timing behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_keepalive_interval_seconds")]
    pub keepalive_interval_seconds: u64,
    #[serde(default = "default_keepalive_max_missed")]
    pub keepalive_max_missed: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            keepalive_interval_seconds: default_keepalive_interval_seconds(),
            keepalive_max_missed: default_keepalive_max_missed(),
        }
    }
}

/// The wire shape for the `port_forwarding` object — kept as its own type
/// so the `rules` nesting in the JSON document (see the external interface
/// section of the design doc) round-trips without a custom (De)serialize
/// impl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortForwardingConfig {
    #[serde(default)]
    pub rules: Vec<ForwardRule>,
}

/// Complete configuration for one supervised tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ssh_key: SshKeyConfig,
    #[serde(default)]
    pub port_forwarding: PortForwardingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Config {
    /// Parse a `Config` from its JSON wire representation.
    pub fn from_json(data: &str) -> Result<Self, crate::error::CoreError> {
        serde_json::from_str(data)
            .map_err(|e| crate::error::CoreError::ConfigError(format!("invalid config: {e}")))
    }

    pub fn forwards(&self) -> &[ForwardRule] {
        &self.port_forwarding.rules
    }

    /// Validate the configuration, returning every problem found rather than
    /// stopping at the first one, so a sidecar can surface them all at once.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.hostname.trim().is_empty() {
            errors.push("server hostname is required".to_string());
        }
        if self.server.username.trim().is_empty() {
            errors.push("server username is required".to_string());
        }
        if self.server.port == 0 {
            errors.push("server port must be between 1 and 65535".to_string());
        }
        if self.ssh_key.path.trim().is_empty() {
            errors.push("ssh key path is required".to_string());
        }

        for (i, rule) in self.port_forwarding.rules.iter().enumerate() {
            if rule.local_port == 0 {
                errors.push(format!(
                    "forward rule {}: local port must be between 1 and 65535",
                    i + 1
                ));
            }
            if rule.remote_port == 0 {
                errors.push(format!(
                    "forward rule {}: remote port must be between 1 and 65535",
                    i + 1
                ));
            }
        }

        let mut seen_remote_ports = std::collections::HashSet::new();
        for rule in self.port_forwarding.rules.iter().filter(|r| r.enabled) {
            if !seen_remote_ports.insert(rule.remote_port) {
                errors.push(format!(
                    "duplicate enabled remote port {}",
                    rule.remote_port
                ));
            }
        }

        if self.reconnect.backoff_multiplier < 1.0 {
            errors.push("reconnect backoff_multiplier must be >= 1".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            server: ServerConfig {
                hostname: "tunnel.example.com".to_string(),
                port: 22,
                username: "deploy".to_string(),
            },
            ssh_key: SshKeyConfig {
                path: "/home/deploy/.ssh/id_ed25519".to_string(),
                passphrase_in_keyring: false,
            },
            port_forwarding: PortForwardingConfig {
                rules: vec![ForwardRule::new(8080, 12345)],
            },
            reconnect: ReconnectConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    #[test]
    fn valid_config_has_no_errors() {
        assert!(sample_config().validate().is_empty());
    }

    #[test]
    fn missing_hostname_and_username_are_reported() {
        let mut config = sample_config();
        config.server.hostname.clear();
        config.server.username.clear();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("hostname")));
        assert!(errors.iter().any(|e| e.contains("username")));
    }

    #[test]
    fn duplicate_enabled_remote_port_is_rejected() {
        let mut config = sample_config();
        let mut second = ForwardRule::new(8081, 12345);
        second.description = "duplicate".to_string();
        config.port_forwarding.rules.push(second);
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("duplicate enabled remote port")));
    }

    #[test]
    fn duplicate_remote_port_is_allowed_when_one_rule_is_disabled() {
        let mut config = sample_config();
        let mut second = ForwardRule::new(8081, 12345);
        second.enabled = false;
        config.port_forwarding.rules.push(second);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut config = sample_config();
        config.port_forwarding.rules[0].local_port = 0;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("local port")));
    }

    #[test]
    fn from_json_round_trips_wire_shape() {
        let json = r#"
        {
          "server": {"hostname": "h", "port": 2222, "username": "u"},
          "ssh_key": {"path": "/k", "passphrase_in_keyring": true},
          "port_forwarding": {"rules": [
            {"local_port": 80, "remote_port": 8080, "remote_bind_address": "0.0.0.0", "enabled": true, "description": "web"}
          ]},
          "reconnect": {"enabled": true, "max_attempts": 0, "initial_delay_seconds": 1.0, "max_delay_seconds": 30.0, "backoff_multiplier": 2.0},
          "connection": {"timeout_seconds": 10, "keepalive_interval_seconds": 15, "keepalive_max_missed": 2}
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.server.hostname, "h");
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.forwards().len(), 1);
        assert_eq!(config.forwards()[0].remote_bind_address, "0.0.0.0");
        assert_eq!(config.connection.timeout_seconds, 10);
    }

    #[test]
    fn from_json_rejects_malformed_document() {
        assert!(Config::from_json("{ not json").is_err());
    }
}
