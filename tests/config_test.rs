//! Integration tests for configuration loading

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use udp_mqtt_gateway::domain::{MqttVersion, QosLevel};
use udp_mqtt_gateway::infra::{Cli, Config, ConfigError};

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = "\
# UDP MQTT Gateway configuration
InputUdpPort 4711

MqttUrl ssl://broker.example:8883
MqttTopic telemetry/raw     # where datagrams end up
MqttClientID gateway-01
MqttUsername gateway
MqttPassword s3cret

MqttVersion 3.1.1
MqttQosLevel 2
MqttKeepAliveInterval 30
MqttSslTrustStore /etc/ssl/certs/ca.pem
";

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.config_file(), temp_file.path().display().to_string());
    assert_eq!(config.input_udp_port(), 4711);
    assert_eq!(config.mqtt_url(), "ssl://broker.example:8883");
    assert_eq!(config.mqtt_topic(), "telemetry/raw");
    assert_eq!(config.mqtt_client_id(), "gateway-01");
    assert_eq!(config.mqtt_username(), Some("gateway"));
    assert_eq!(config.mqtt_password(), Some("s3cret"));
    assert_eq!(config.mqtt_version(), MqttVersion::V3_1_1);
    assert_eq!(config.mqtt_qos(), QosLevel::ExactlyOnce);
    assert_eq!(config.mqtt_keep_alive(), Duration::from_secs(30));
    assert_eq!(config.mqtt_retry_interval(), Duration::from_millis(1000));
    assert_eq!(config.tls().trust_store.as_deref(), Some("/etc/ssl/certs/ca.pem"));
}

#[test]
fn test_missing_file_is_io_error() {
    match Config::from_file("/nonexistent/udpmqttgw.conf") {
        Err(ConfigError::Io { path, .. }) => assert_eq!(path, "/nonexistent/udpmqttgw.conf"),
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn test_invalid_utf8_is_syntax_error_at_line() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"InputUdpPort 9000\nMqttTopic caf\xe9\nMqttUrl tcp://localhost\n").unwrap();

    match Config::from_file(temp_file.path()) {
        Err(ConfigError::Syntax { line, reason }) => {
            assert_eq!(line, 2);
            assert!(reason.contains("UTF-8"));
        }
        other => panic!("expected syntax error, got {other:?}"),
    }
}

#[test]
fn test_cli_layers_verbosity_over_file() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(b"InputUdpPort 9000\nMqttUrl tcp://localhost\nMqttTopic t\nMqttClientID gw\n")
        .unwrap();
    temp_file.flush().unwrap();

    let flag = format!("-c={}", temp_file.path().display());
    let cli = Cli::try_parse_args(["udpmqttgw", "-v", flag.as_str()]).unwrap();

    let config = Config::from_file(&cli.config).unwrap().with_verbosity(cli.verbose);
    assert_eq!(config.verbosity(), 1);
    assert_eq!(config.input_udp_port(), 9000);
}

#[test]
fn test_validation_errors_are_collected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"MqttUsername foo\n").unwrap();
    temp_file.flush().unwrap();

    match Config::from_file(temp_file.path()) {
        Err(ConfigError::Validation { problems }) => {
            // port, url, topic, client id, password
            assert_eq!(problems.len(), 5);
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}
