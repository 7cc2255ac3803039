//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap, with an environment variable per flag
//! - Conversion of the parsed settings into per-component configs

mod args;

pub use args::{parse_duration, Args, Attributes};
