//! CLI module
//!
//! Command-line interface and configuration for the node binary.

pub mod args;
pub mod config;

pub use args::{CliArgs, LogFormat};
pub use config::{Config, IdGeneratorKind};
