//! Command line interface
//!
//! Accepts `-h`, `-v` (repeatable) and `-c=<path>`; anything else is a
//! usage error.

use crate::infra::config::DEFAULT_CONFIG_PATH;
use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// UDP to MQTT gateway - forwards every received datagram to an MQTT topic
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "udpmqttgw", about, disable_version_flag = true, args_override_self = true)]
pub struct Cli {
    /// Increase output verbosity (-v info, -vv per-datagram debug)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to config file
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl Cli {
    /// Parse arguments without exiting; `main` maps the error to an exit code
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    /// Exit code for a parse failure: 0 for help output, 1 for usage errors
    pub fn exit_code(error: &clap::Error) -> u8 {
        if error.use_stderr() {
            1
        } else {
            0
        }
    }
}
