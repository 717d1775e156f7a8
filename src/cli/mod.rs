//! CLI module for gpulane.

mod commands;

pub use commands::{parse_input_arg, Cli, Commands};
