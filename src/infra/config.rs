//! Configuration loading from the gateway `.conf` file
//!
//! The file is line oriented: `KEY value`, one setting per line, `#` starts
//! a comment. Unknown keys are ignored so newer files keep working with
//! older gateways.
//!
//! Config file is selected via:
//! 1. `-c=<path>` command line argument
//! 2. Default: /etc/udpmqttgw.conf

use crate::domain::{MqttVersion, QosLevel, TlsVersion};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/udpmqttgw.conf";

const DEFAULT_KEEP_ALIVE_SECS: u64 = 20;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 1;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Errors raised while reading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to open config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed line or unknown enumerated value; aborts parsing
    #[error("invalid syntax at line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    /// Value that should be a number (or in range) but is not
    #[error("invalid value for {key} at line {line}: {value:?}")]
    Argument { line: usize, key: &'static str, value: String },

    /// Every violated requirement found after the whole file was read
    #[error("invalid configuration: {}", problems.join("; "))]
    Validation { problems: Vec<String> },
}

/// Optional TLS block
///
/// Each field stays `None` unless the file sets it, so the session can tell
/// "TLS not configured" apart from "TLS configured with defaults".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub enable_server_cert_auth: Option<bool>,
    pub version: Option<TlsVersion>,
    pub verify: Option<bool>,
    pub trust_store: Option<String>,
    pub key_store: Option<String>,
    pub private_key: Option<String>,
    pub private_key_passphrase: Option<String>,
}

impl TlsSettings {
    /// True when at least one TLS key appeared in the file
    pub fn is_configured(&self) -> bool {
        *self != Self::default()
    }

    pub fn enable_server_cert_auth(&self) -> bool {
        self.enable_server_cert_auth.unwrap_or(true)
    }

    pub fn version(&self) -> TlsVersion {
        self.version.unwrap_or_default()
    }

    pub fn verify(&self) -> bool {
        self.verify.unwrap_or(false)
    }
}

/// Main configuration struct used throughout the application
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    verbosity: u8,
    input_udp_port: u16,
    mqtt_url: String,
    mqtt_topic: String,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_version: MqttVersion,
    mqtt_qos: QosLevel,
    mqtt_keep_alive_secs: u64,
    mqtt_retry_interval_ms: u64,
    mqtt_connection_timeout_ms: u64,
    mqtt_connect_attempts: u32,
    stats_interval_secs: u64,
    tls: TlsSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: DEFAULT_CONFIG_PATH.to_string(),
            verbosity: 0,
            input_udp_port: 0,
            mqtt_url: String::new(),
            mqtt_topic: String::new(),
            mqtt_client_id: String::new(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_version: MqttVersion::Default,
            mqtt_qos: QosLevel::AtMostOnce,
            mqtt_keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            mqtt_retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            mqtt_connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            mqtt_connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            tls: TlsSettings::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a `.conf` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let content = String::from_utf8(bytes).map_err(|e| {
            let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
            ConfigError::Syntax {
                line: valid.iter().filter(|&&b| b == b'\n').count() + 1,
                reason: "invalid UTF-8".to_string(),
            }
        })?;

        let mut config = Self::parse_str(&content)?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Parse and validate configuration text
    ///
    /// Syntax and argument errors abort at the offending line; validation
    /// runs afterwards and reports every problem at once.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = strip_comment(raw).trim_matches(|c| c == ' ' || c == '\t');
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(' ') else {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    reason: format!("expected `KEY value`, got {line:?}"),
                });
            };
            config.apply(line_no, key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Layer command line settings on top of the file settings
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "InputUdpPort" => self.input_udp_port = parse_port(line, "InputUdpPort", value)?,
            "MqttUrl" => self.mqtt_url = value.to_string(),
            "MqttTopic" => self.mqtt_topic = value.to_string(),
            "MqttClientID" => self.mqtt_client_id = value.to_string(),
            "MqttUsername" => self.mqtt_username = non_empty(value),
            "MqttPassword" => self.mqtt_password = non_empty(value),
            "MqttVersion" => {
                self.mqtt_version = MqttVersion::parse(value).ok_or_else(|| ConfigError::Syntax {
                    line,
                    reason: format!("invalid value for MqttVersion: {value:?}"),
                })?;
            }
            "MqttQosLevel" => {
                let level = parse_int(line, "MqttQosLevel", value)?;
                self.mqtt_qos = QosLevel::from_level(level).ok_or_else(|| {
                    ConfigError::Argument { line, key: "MqttQosLevel", value: value.to_string() }
                })?;
            }
            "MqttKeepAliveInterval" => {
                self.mqtt_keep_alive_secs = parse_unsigned(line, "MqttKeepAliveInterval", value)?;
            }
            "MqttRetryInterval" => {
                self.mqtt_retry_interval_ms = parse_unsigned(line, "MqttRetryInterval", value)?;
            }
            "MqttConnectionTimeout" => {
                self.mqtt_connection_timeout_ms =
                    parse_unsigned(line, "MqttConnectionTimeout", value)?;
            }
            "MqttConnectAttempts" => {
                let attempts = parse_unsigned(line, "MqttConnectAttempts", value)?;
                self.mqtt_connect_attempts = u32::try_from(attempts).map_err(|_| {
                    ConfigError::Argument {
                        line,
                        key: "MqttConnectAttempts",
                        value: value.to_string(),
                    }
                })?;
            }
            "StatsIntervalSecs" => {
                self.stats_interval_secs = parse_unsigned(line, "StatsIntervalSecs", value)?;
            }
            "MqttSslEnableServerCertAuth" => {
                self.tls.enable_server_cert_auth =
                    Some(parse_int(line, "MqttSslEnableServerCertAuth", value)? != 0);
            }
            "MqttSslVersion" => {
                let version = TlsVersion::parse(value).ok_or_else(|| ConfigError::Syntax {
                    line,
                    reason: format!("invalid value for MqttSslVersion: {value:?}"),
                })?;
                self.tls.version = Some(version);
            }
            "MqttSslVerify" => {
                self.tls.verify = Some(parse_int(line, "MqttSslVerify", value)? != 0);
            }
            "MqttSslTrustStore" => self.tls.trust_store = non_empty(value),
            "MqttSslKeyStore" => self.tls.key_store = non_empty(value),
            "MqttSslPrivateKey" => self.tls.private_key = non_empty(value),
            "MqttSslPrivateKeyPasswd" => self.tls.private_key_passphrase = non_empty(value),
            // Unknown keys are skipped
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.input_udp_port == 0 {
            problems.push("InputUdpPort must be set in the configuration file".to_string());
        }
        if self.mqtt_url.is_empty() {
            problems.push("MqttUrl must be set in the configuration file".to_string());
        }
        if self.mqtt_topic.is_empty() {
            problems.push("MqttTopic must be set in the configuration file".to_string());
        }
        if self.mqtt_client_id.is_empty() {
            problems.push("MqttClientID must be set in the configuration file".to_string());
        }
        if self.mqtt_username.is_some() && self.mqtt_password.is_none() {
            problems.push("MqttPassword must be set when a username is given".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { problems })
        }
    }

    /// Log the resolved configuration; secrets are masked
    pub fn log(&self) {
        info!(
            config_file = %self.config_file,
            input_udp_port = %self.input_udp_port,
            mqtt_url = %self.mqtt_url,
            mqtt_topic = %self.mqtt_topic,
            mqtt_client_id = %self.mqtt_client_id,
            mqtt_username = ?self.mqtt_username,
            mqtt_password = %mask(self.mqtt_password.as_deref()),
            mqtt_version = %self.mqtt_version,
            mqtt_qos = %self.mqtt_qos,
            keep_alive_secs = %self.mqtt_keep_alive_secs,
            retry_interval_ms = %self.mqtt_retry_interval_ms,
            connection_timeout_ms = %self.mqtt_connection_timeout_ms,
            connect_attempts = %self.mqtt_connect_attempts,
            "config_loaded"
        );

        if self.tls.is_configured() {
            info!(
                server_cert_auth = %self.tls.enable_server_cert_auth(),
                tls_version = %self.tls.version(),
                verify = %self.tls.verify(),
                trust_store = ?self.tls.trust_store,
                key_store = ?self.tls.key_store,
                private_key = ?self.tls.private_key,
                private_key_passphrase = %mask(self.tls.private_key_passphrase.as_deref()),
                "tls_config_loaded"
            );
        }
    }

    // Getters for all config fields
    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn input_udp_port(&self) -> u16 {
        self.input_udp_port
    }

    pub fn mqtt_url(&self) -> &str {
        &self.mqtt_url
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_version(&self) -> MqttVersion {
        self.mqtt_version
    }

    pub fn mqtt_qos(&self) -> QosLevel {
        self.mqtt_qos
    }

    pub fn mqtt_keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn mqtt_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }

    pub fn mqtt_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connection_timeout_ms)
    }

    pub fn mqtt_connect_attempts(&self) -> u32 {
        self.mqtt_connect_attempts
    }

    /// Period of the forwarding statistics report, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn mask(secret: Option<&str>) -> &'static str {
    if secret.is_some() {
        "***"
    } else {
        "-"
    }
}

fn parse_int(line: usize, key: &'static str, value: &str) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::Argument { line, key, value: value.to_string() })
}

fn parse_unsigned(line: usize, key: &'static str, value: &str) -> Result<u64, ConfigError> {
    let parsed = parse_int(line, key, value)?;
    u64::try_from(parsed).map_err(|_| ConfigError::Argument { line, key, value: value.to_string() })
}

fn parse_port(line: usize, key: &'static str, value: &str) -> Result<u16, ConfigError> {
    let parsed = parse_int(line, key, value)?;
    u16::try_from(parsed).map_err(|_| ConfigError::Argument { line, key, value: value.to_string() })
}
