//! nearchat CLI library
//!
//! Command parsing, configuration loading and the terminal front end for the
//! host and guest roles.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::ChatApp;
pub use cli::{Cli, Commands};
pub use config::{Backend, CliConfig, LogConfig};
pub use error::{CliError, Result};
