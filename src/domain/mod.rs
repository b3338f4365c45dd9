//! Domain models - the values that flow through the gateway
//!
//! - `Datagram` - one UDP packet awaiting publication
//! - `QosLevel`, `MqttVersion`, `TlsVersion` - enumerated session settings

pub mod types;

pub use types::{Datagram, MqttVersion, QosLevel, TlsVersion, UDP_BUFFER_SIZE};
