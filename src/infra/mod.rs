//! Infrastructure - command line, configuration and statistics
//!
//! - `cli` - command line flags
//! - `config` - `.conf` file parsing and validation
//! - `stats` - forwarding counters

pub mod cli;
pub mod config;
pub mod stats;

// Re-export commonly used types
pub use cli::Cli;
pub use config::{Config, ConfigError, TlsSettings};
pub use stats::ForwardStats;
