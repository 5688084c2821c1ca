//! CLI argument models for the kaiwa binary.
//!
//! Every flag can also be supplied through its environment variable, which is
//! how the bot is configured in deployment.

pub mod cli_args;
pub mod cli_types;

pub use cli_args::{Cli, CliCommand};
pub use cli_types::*;
