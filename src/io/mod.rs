//! IO modules - external system interfaces
//!
//! - `udp` - inbound UDP socket
//! - `mqtt` - outbound MQTT broker session
//! - `tls` - rustls client configuration for the session

pub mod mqtt;
pub mod tls;
pub mod udp;

pub use mqtt::{ConnectError, ConnectOptions, ConnectRefusal, PublishError, RetryPolicy, Session};
pub use tls::TlsOptions;
pub use udp::DatagramSocket;
