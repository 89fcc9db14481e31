#![deny(unsafe_code)]

//! # Overview
//!
//! Maps udxfer's `-v`/`-vv`/`--quiet` flags onto a `tracing-subscriber`
//! `EnvFilter`, so every crate in the workspace logs through ordinary
//! `tracing` spans and events instead of a bespoke printf wrapper.
//!
//! # Design
//!
//! [`Verbosity`] is the small, closed surface the CLI layer parses flags
//! into; [`init`] installs a global subscriber once per process. Calling
//! `init` a second time is a no-op (the underlying `tracing` global
//! dispatcher can only be set once), which keeps tests that call it
//! multiple times from panicking.

use tracing_subscriber::EnvFilter;

/// Verbosity level requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// `--quiet`: only errors.
    Quiet,
    /// Default: warnings and errors.
    #[default]
    Normal,
    /// `-v`: info-level progress.
    Verbose,
    /// `-vv`: debug-level protocol tracing.
    Debug,
}

impl Verbosity {
    fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "warn",
            Verbosity::Verbose => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, the default for an interactive terminal.
    #[default]
    Text,
    /// Newline-delimited JSON, for log aggregation.
    Json,
}

/// Installs the global `tracing` subscriber for the requested verbosity
/// and format. Safe to call more than once; subsequent calls are no-ops.
pub fn init(verbosity: Verbosity, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));

    let result = match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .try_init(),
    };
    // A second `init` in the same process (common across test binaries)
    // fails because the global dispatcher is already set; that's fine.
    let _ = result;
}
