//! Log subscriber setup shared by the mesh binaries.
//!
//! Mesh crates log at the requested level. Everything else is capped at
//! `info`, and the webrtc/websocket stack stays at `warn` unless
//! `MESH_TRACE_DEPS` is set, since ICE and DTLS are chatty well before trace.
//! `MESH_LOG_FILTER` replaces the whole filter with a raw `EnvFilter` directive string.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, ParseError};

const MESH_CRATES: &[&str] = &["peer_mesh", "mesh_call"];

const TRANSPORT_CRATES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "tokio_tungstenite",
    "tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once installed, later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let transport_traces = std::env::var("MESH_TRACE_DEPS").is_ok_and(|v| !v.is_empty() && v != "0");
    let filter = match std::env::var("MESH_LOG_FILTER") {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => build_filter(config.level, transport_traces)?,
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = GUARD.set(guard);

    tracing::debug!(level = ?config.level, transport_traces, "logging initialised");
    Ok(())
}

/// Per-crate levels: `None` is the default for crates not listed.
fn directives(level: LogLevel, transport_traces: bool) -> Vec<(Option<&'static str>, LevelFilter)> {
    let others = level.min(LogLevel::Info);
    let transport = if transport_traces {
        level
    } else {
        others.min(LogLevel::Warn)
    };
    let mut directives = vec![(None, LevelFilter::from(others))];
    directives.extend(MESH_CRATES.iter().map(|name| (Some(*name), level.into())));
    directives.extend(TRANSPORT_CRATES.iter().map(|name| (Some(*name), transport.into())));
    directives
}

fn build_filter(level: LogLevel, transport_traces: bool) -> Result<EnvFilter, ParseError> {
    let mut filter = EnvFilter::default();
    for (target, level) in directives(level, transport_traces) {
        let directive: Directive = match target {
            Some(target) => format!("{target}={level}").parse()?,
            None => level.into(),
        };
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}
