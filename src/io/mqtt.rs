//! MQTT session towards the upstream broker
//!
//! One connection, created once at startup. The session drives the rumqttc
//! event loop itself instead of spawning it, so a publish can block until
//! its own acknowledgment arrives:
//! - QoS 0 completes when the PUBLISH has been written
//! - QoS 1 completes on the matching PUBACK
//! - QoS 2 completes on the matching PUBCOMP
//!
//! Between publishes the forwarder calls `idle()` so keep-alive pings and
//! reconnects keep happening while no datagram arrives.

use super::tls::TlsOptions;
use crate::domain::{MqttVersion, QosLevel};
use crate::infra::config::Config;
use crate::services::forwarder::Publisher;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5;
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode as V5ReturnCode;
use rumqttc::{ConnectReturnCode, Outgoing};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

const MQTT_PORT: u16 = 1883;
const MQTTS_PORT: u16 = 8883;

/// Capacity of the rumqttc request channel; only one publish is ever queued
const REQUEST_CAPACITY: usize = 10;

/// Upper bound for the connect backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Why the broker refused the CONNECT
///
/// Numeric codes follow the gateway's historical error output (-1 to -5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRefusal {
    ProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown(i32),
}

impl ConnectRefusal {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Self::ProtocolVersion,
            -2 => Self::IdentifierRejected,
            -3 => Self::ServerUnavailable,
            -4 => Self::BadCredentials,
            -5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }

    /// Map an MQTT 3.1.1 CONNACK return code
    pub fn from_v4(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::RefusedProtocolVersion => Self::ProtocolVersion,
            ConnectReturnCode::BadClientId => Self::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => Self::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => Self::BadCredentials,
            ConnectReturnCode::NotAuthorized => Self::NotAuthorized,
            ConnectReturnCode::Success => Self::Unknown(0),
        }
    }

    /// Map an MQTT 5 CONNACK reason code onto the 3.1.1 refusal classes
    ///
    /// Reasons without a 3.1.1 counterpart keep their wire value.
    pub fn from_v5(code: V5ReturnCode) -> Self {
        match code {
            V5ReturnCode::RefusedProtocolVersion | V5ReturnCode::UnsupportedProtocolVersion => {
                Self::ProtocolVersion
            }
            V5ReturnCode::BadClientId | V5ReturnCode::ClientIdentifierNotValid => {
                Self::IdentifierRejected
            }
            V5ReturnCode::ServiceUnavailable
            | V5ReturnCode::ServerUnavailable
            | V5ReturnCode::ServerBusy => Self::ServerUnavailable,
            V5ReturnCode::BadUserNamePassword | V5ReturnCode::BadAuthenticationMethod => {
                Self::BadCredentials
            }
            V5ReturnCode::NotAuthorized | V5ReturnCode::Banned => Self::NotAuthorized,
            V5ReturnCode::MalformedPacket => Self::Unknown(0x81),
            V5ReturnCode::ProtocolError => Self::Unknown(0x82),
            V5ReturnCode::ImplementationSpecificError => Self::Unknown(0x83),
            V5ReturnCode::QuotaExceeded => Self::Unknown(0x97),
            V5ReturnCode::UseAnotherServer => Self::Unknown(0x9C),
            V5ReturnCode::ServerMoved => Self::Unknown(0x9D),
            V5ReturnCode::ConnectionRateExceeded => Self::Unknown(0x9F),
            _ => Self::Unknown(0x80),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::ProtocolVersion => -1,
            Self::IdentifierRejected => -2,
            Self::ServerUnavailable => -3,
            Self::BadCredentials => -4,
            Self::NotAuthorized => -5,
            Self::Unknown(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ProtocolVersion => "Unacceptable protocol version",
            Self::IdentifierRejected => "Identifier rejected",
            Self::ServerUnavailable => "Server unavailable",
            Self::BadCredentials => "Bad user name or password",
            Self::NotAuthorized => "Not authorized",
            Self::Unknown(_) => "Unknown error code",
        }
    }
}

/// Errors establishing the broker session; all fatal at startup
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid broker URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("MQTT {0} is not supported by this gateway, use 3.1.1 or 5")]
    UnsupportedProtocol(MqttVersion),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("unable to read TLS file {path}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no CONNACK from broker within {0:?}")]
    Timeout(Duration),

    #[error("failed to connect to MQTT broker, error {}: {}", .0.code(), .0.description())]
    Refused(ConnectRefusal),

    #[error("failed to connect to MQTT broker: {0}")]
    Transport(String),
}

impl ConnectError {
    /// Worth another attempt under a backoff policy
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::Refused(ConnectRefusal::ServerUnavailable)
        )
    }
}

/// Errors for a single publish; the session stays usable
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish request rejected: {0}")]
    Submit(String),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Transport(String),
}

/// Connect parameters derived from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub protocol: MqttVersion,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub credentials: Option<(String, String)>,
    pub tls: Option<TlsOptions>,
}

impl ConnectOptions {
    /// Derive connect options from the broker URL and session settings
    ///
    /// `tcp://` and `mqtt://` are plain, `ssl://`, `mqtts://` and `tls://`
    /// are encrypted. A TLS block in the file also switches TLS on.
    pub fn from_config(config: &Config) -> Result<Self, ConnectError> {
        let invalid = |reason: String| ConnectError::InvalidUrl {
            url: config.mqtt_url().to_string(),
            reason,
        };

        let url = Url::parse(config.mqtt_url()).map_err(|e| invalid(e.to_string()))?;
        let secure = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            other => return Err(invalid(format!("unsupported scheme {other:?}"))),
        };
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let port = url.port().unwrap_or(if secure { MQTTS_PORT } else { MQTT_PORT });

        let tls = (secure || config.tls().is_configured())
            .then(|| TlsOptions::from_settings(config.tls()));

        let credentials = match (config.mqtt_username(), config.mqtt_password()) {
            (Some(username), Some(password)) => Some((username.to_string(), password.to_string())),
            _ => None,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            client_id: config.mqtt_client_id().to_string(),
            protocol: config.mqtt_version(),
            keep_alive: config.mqtt_keep_alive(),
            clean_session: true,
            connect_timeout: config.mqtt_connection_timeout(),
            retry_interval: config.mqtt_retry_interval(),
            credentials,
            tls,
        })
    }
}

/// What to do when the initial connect fails
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Give up on the first failure
    FailFast,
    /// Exponential backoff starting at `base`; `attempts: None` retries forever
    Backoff { attempts: Option<u32>, base: Duration, max: Duration },
}

impl RetryPolicy {
    /// `MqttConnectAttempts`: 1 fails fast, 0 retries forever, n tries n times
    pub fn from_config(config: &Config) -> Self {
        let base = config.mqtt_retry_interval();
        match config.mqtt_connect_attempts() {
            1 => Self::FailFast,
            0 => Self::Backoff { attempts: None, base, max: MAX_BACKOFF },
            n => Self::Backoff { attempts: Some(n), base, max: MAX_BACKOFF },
        }
    }

    /// Delay before attempt `attempt + 1`, or `None` to give up
    pub fn delay_for(&self, attempt: u32, error: &ConnectError) -> Option<Duration> {
        match self {
            Self::FailFast => None,
            Self::Backoff { attempts, base, max } => {
                if !error.is_transient() || attempts.is_some_and(|limit| attempt >= limit) {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Some(base.saturating_mul(factor).min(*max))
            }
        }
    }
}

/// Event loop events the session cares about
#[derive(Debug)]
enum LinkEvent {
    ConnAck,
    Written(u16),
    PubAck(u16),
    PubComp(u16),
    Disconnected,
    Other,
}

#[derive(Debug, Error)]
enum LinkError {
    #[error("connection refused, error {}: {}", .0.code(), .0.description())]
    Refused(ConnectRefusal),
    #[error("{0}")]
    Transport(String),
}

/// rumqttc client and event loop for the negotiated protocol version
///
/// The built options are kept so the link can be rebuilt from scratch.
enum Link {
    V4 { client: rumqttc::AsyncClient, eventloop: rumqttc::EventLoop, options: rumqttc::MqttOptions },
    V5 { client: v5::AsyncClient, eventloop: v5::EventLoop, options: v5::MqttOptions },
}

impl Link {
    fn open(options: &ConnectOptions) -> Result<Self, ConnectError> {
        let transport = options.tls.as_ref().map(TlsOptions::transport).transpose()?;

        match options.protocol {
            MqttVersion::Default | MqttVersion::V3_1_1 => {
                let mut mqtt =
                    rumqttc::MqttOptions::new(&options.client_id, &options.host, options.port);
                mqtt.set_keep_alive(options.keep_alive);
                mqtt.set_clean_session(options.clean_session);
                if let Some((username, password)) = &options.credentials {
                    mqtt.set_credentials(username, password);
                }
                if let Some(transport) = transport {
                    mqtt.set_transport(transport);
                }
                Ok(Self::v4(mqtt))
            }
            MqttVersion::V5 => {
                let mut mqtt =
                    v5::MqttOptions::new(&options.client_id, &options.host, options.port);
                mqtt.set_keep_alive(options.keep_alive);
                mqtt.set_clean_start(options.clean_session);
                if let Some((username, password)) = &options.credentials {
                    mqtt.set_credentials(username, password);
                }
                if let Some(transport) = transport {
                    mqtt.set_transport(transport);
                }
                Ok(Self::v5(mqtt))
            }
            MqttVersion::V3_1 => Err(ConnectError::UnsupportedProtocol(MqttVersion::V3_1)),
        }
    }

    fn v4(options: rumqttc::MqttOptions) -> Self {
        let (client, eventloop) = rumqttc::AsyncClient::new(options.clone(), REQUEST_CAPACITY);
        Self::V4 { client, eventloop, options }
    }

    fn v5(options: v5::MqttOptions) -> Self {
        let (client, eventloop) = v5::AsyncClient::new(options.clone(), REQUEST_CAPACITY);
        Self::V5 { client, eventloop, options }
    }

    /// Drop the connection together with every queued and in-flight request
    ///
    /// rumqttc replays unacknowledged requests after a reconnect; a fresh
    /// client and event loop have nothing to replay. The next poll connects.
    fn reset(&mut self) {
        *self = match self {
            Self::V4 { options, .. } => Self::v4(options.clone()),
            Self::V5 { options, .. } => Self::v5(options.clone()),
        };
    }

    async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        match self {
            Self::V4 { eventloop, .. } => match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(packet)) => Ok(match packet {
                    rumqttc::Packet::ConnAck(_) => LinkEvent::ConnAck,
                    rumqttc::Packet::PubAck(ack) => LinkEvent::PubAck(ack.pkid),
                    rumqttc::Packet::PubComp(comp) => LinkEvent::PubComp(comp.pkid),
                    _ => LinkEvent::Other,
                }),
                Ok(rumqttc::Event::Outgoing(outgoing)) => Ok(outgoing_event(outgoing)),
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    Err(LinkError::Refused(ConnectRefusal::from_v4(code)))
                }
                Err(e) => Err(LinkError::Transport(e.to_string())),
            },
            Self::V5 { eventloop, .. } => match eventloop.poll().await {
                Ok(v5::Event::Incoming(packet)) => {
                    use rumqttc::v5::mqttbytes::v5::Packet;
                    Ok(match packet {
                        Packet::ConnAck(_) => LinkEvent::ConnAck,
                        Packet::PubAck(ack) => LinkEvent::PubAck(ack.pkid),
                        Packet::PubComp(comp) => LinkEvent::PubComp(comp.pkid),
                        _ => LinkEvent::Other,
                    })
                }
                Ok(v5::Event::Outgoing(outgoing)) => Ok(outgoing_event(outgoing)),
                Err(v5::ConnectionError::ConnectionRefused(code)) => {
                    Err(LinkError::Refused(ConnectRefusal::from_v5(code)))
                }
                Err(e) => Err(LinkError::Transport(e.to_string())),
            },
        }
    }

    /// Queue a PUBLISH without waiting for channel capacity
    fn submit(&self, topic: &str, payload: &Bytes, qos: QosLevel) -> Result<(), PublishError> {
        let result = match self {
            Self::V4 { client, .. } => client
                .try_publish(topic, v4_qos(qos), false, payload.to_vec())
                .map_err(|e| e.to_string()),
            Self::V5 { client, .. } => client
                .try_publish(topic, v5_qos(qos), false, payload.to_vec())
                .map_err(|e| e.to_string()),
        };
        result.map_err(PublishError::Submit)
    }

    fn request_disconnect(&self) -> Result<(), String> {
        match self {
            Self::V4 { client, .. } => client.try_disconnect().map_err(|e| e.to_string()),
            Self::V5 { client, .. } => client.try_disconnect().map_err(|e| e.to_string()),
        }
    }
}

fn outgoing_event(outgoing: Outgoing) -> LinkEvent {
    match outgoing {
        Outgoing::Publish(pkid) => LinkEvent::Written(pkid),
        Outgoing::Disconnect => LinkEvent::Disconnected,
        _ => LinkEvent::Other,
    }
}

fn v4_qos(qos: QosLevel) -> rumqttc::QoS {
    match qos {
        QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn v5_qos(qos: QosLevel) -> v5::mqttbytes::QoS {
    match qos {
        QosLevel::AtMostOnce => v5::mqttbytes::QoS::AtMostOnce,
        QosLevel::AtLeastOnce => v5::mqttbytes::QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// The broker connection
///
/// Holds at most one publish. A publish that fails or times out resets the
/// link, so a datagram reported as failed is never delivered later.
pub struct Session {
    link: Link,
    options: ConnectOptions,
}

impl Session {
    /// Connect using the configuration's retry policy
    pub async fn connect(config: &Config) -> Result<Self, ConnectError> {
        let options = ConnectOptions::from_config(config)?;
        Self::connect_with(options, RetryPolicy::from_config(config)).await
    }

    pub async fn connect_with(
        options: ConnectOptions,
        policy: RetryPolicy,
    ) -> Result<Self, ConnectError> {
        let mut attempt = 1;
        loop {
            match Self::try_connect(&options).await {
                Ok(session) => return Ok(session),
                Err(e) => match policy.delay_for(attempt, &e) {
                    Some(delay) => {
                        warn!(
                            attempt = %attempt,
                            delay_ms = %delay.as_millis(),
                            error = %e,
                            "mqtt_connect_retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn try_connect(options: &ConnectOptions) -> Result<Self, ConnectError> {
        let mut link = Link::open(options)?;

        let connack = async {
            loop {
                match link.poll().await {
                    Ok(LinkEvent::ConnAck) => return Ok(()),
                    Ok(_) => {}
                    Err(LinkError::Refused(refusal)) => return Err(ConnectError::Refused(refusal)),
                    Err(LinkError::Transport(e)) => return Err(ConnectError::Transport(e)),
                }
            }
        };
        tokio::time::timeout(options.connect_timeout, connack)
            .await
            .map_err(|_| ConnectError::Timeout(options.connect_timeout))??;

        info!(
            host = %options.host,
            port = %options.port,
            client_id = %options.client_id,
            protocol = %options.protocol,
            tls = %options.tls.is_some(),
            "mqtt_connected"
        );

        Ok(Self { link, options: options.clone() })
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Poll until the current publish completes
    ///
    /// The link never holds anything but the current request, so every
    /// write and acknowledgment seen here belongs to it.
    async fn await_completion(&mut self, qos: QosLevel) -> Result<(), PublishError> {
        let mut written = None;
        loop {
            match self.link.poll().await {
                Ok(LinkEvent::Written(_)) if qos == QosLevel::AtMostOnce => return Ok(()),
                Ok(LinkEvent::Written(pkid)) => written = Some(pkid),
                Ok(LinkEvent::PubAck(pkid))
                    if qos == QosLevel::AtLeastOnce && written == Some(pkid) =>
                {
                    return Ok(());
                }
                Ok(LinkEvent::PubComp(pkid))
                    if qos == QosLevel::ExactlyOnce && written == Some(pkid) =>
                {
                    return Ok(());
                }
                Ok(LinkEvent::ConnAck) => info!("mqtt_reconnected"),
                Ok(_) => {}
                Err(e) => return Err(PublishError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl Publisher for Session {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        timeout: Duration,
    ) -> Result<(), PublishError> {
        let result = match self.link.submit(topic, &payload, qos) {
            Ok(()) => tokio::time::timeout(timeout, self.await_completion(qos))
                .await
                .unwrap_or(Err(PublishError::Timeout(timeout))),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            debug!(error = %e, "mqtt_session_reset");
            self.link.reset();
        }
        result
    }

    async fn idle(&mut self) {
        match self.link.poll().await {
            Ok(LinkEvent::ConnAck) => info!("mqtt_reconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    retry_ms = %self.options.retry_interval.as_millis(),
                    "mqtt_connection_lost"
                );
                tokio::time::sleep(self.options.retry_interval).await;
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.link.request_disconnect() {
            warn!(error = %e, "mqtt_disconnect_failed");
            return;
        }

        let timeout = self.options.connect_timeout;
        let link = &mut self.link;
        let drain = async {
            loop {
                match link.poll().await {
                    Ok(LinkEvent::Disconnected) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => info!("mqtt_disconnected"),
            Err(_) => debug!("mqtt_disconnect_timeout"),
        }
    }
}
