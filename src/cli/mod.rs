//! Command line interface
//!
//! Argument parsing, validated configuration, registry credentials from a
//! docker config file, and the runner that wires an import together.

pub mod args;
pub mod auth_file;
pub mod config;
pub mod runner;

pub use args::Args;
pub use config::{AuthConfig, ImportConfig};
pub use runner::Runner;
