//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Writing transactions as JSON Lines or text

mod args;
mod output;

pub use args::{Args, PortSpec};
pub use output::{OutputFormat, OutputSink};
