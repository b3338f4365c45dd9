//! Shared types for the gateway

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Largest datagram payload forwarded; longer datagrams are truncated
pub const UDP_BUFFER_SIZE: usize = 2048;

/// One datagram taken off the inbound socket
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Bytes,
    pub source: SocketAddr,
    /// The sender's datagram was longer than `UDP_BUFFER_SIZE`
    pub truncated: bool,
}

impl Datagram {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// MQTT delivery guarantee requested for published messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Protocol version requested in the CONNECT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MqttVersion {
    /// Let the client pick (3.1.1)
    #[default]
    Default,
    V3_1,
    V3_1_1,
    V5,
}

impl MqttVersion {
    /// Parse the config file spelling (`default`, `3.1`, `3.1.1`, `5`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" => Some(Self::Default),
            "3.1" => Some(Self::V3_1),
            "3.1.1" => Some(Self::V3_1_1),
            "5" => Some(Self::V5),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::V3_1 => "3.1",
            Self::V3_1_1 => "3.1.1",
            Self::V5 => "5",
        }
    }
}

impl fmt::Display for MqttVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS protocol version requested for encrypted sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Default,
    V1_0,
    V1_1,
    #[default]
    V1_2,
}

impl TlsVersion {
    /// Parse the config file spelling (`default`, `1.0`, `1.1`, `1.2`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" => Some(Self::Default),
            "1.0" => Some(Self::V1_0),
            "1.1" => Some(Self::V1_1),
            "1.2" => Some(Self::V1_2),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
