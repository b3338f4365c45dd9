//! Services - the forwarding loop
//!
//! - `forwarder` - receives datagrams and publishes them one at a time

pub mod forwarder;

pub use forwarder::{DatagramSource, Forwarder, Publisher};
