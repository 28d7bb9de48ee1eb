//! Tracing subscriber setup

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::error::{FixbaseError, Result};

/// Directive applied when no level is given
pub const DEFAULT_DIRECTIVE: &str = "fixbase=info";

/// Install the global subscriber. `RUST_LOG` is honoured; `level`
/// overrides the crate's own level.
pub fn init(level: Option<&str>) -> Result<()> {
    let directive = level
        .map(|l| format!("fixbase={}", l))
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string());
    let directive: Directive = directive
        .parse()
        .map_err(|e| FixbaseError::Config(format!("invalid log level '{}': {}", directive, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        // stdout carries command output
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| FixbaseError::Config(format!("logging already initialised: {}", e)))
}
