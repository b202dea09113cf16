use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::supervisor::{Backoff, DEFAULT_RETRY_CEILING, RetryPolicy};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 8_000;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Mesh session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    pub retry: RetryPolicy,
    /// Interval between relay keep-alive pings
    pub heartbeat_interval: Duration,
    /// STUN/TURN urls handed to every new connection
    pub ice_servers: Vec<String>,
}

impl MeshConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let max_retries = parse_var("MESH_RETRY_CEILING").unwrap_or(DEFAULT_RETRY_CEILING);
        let base_ms = parse_var("MESH_RETRY_BASE_MS").unwrap_or(DEFAULT_RETRY_BASE_MS);
        let max_ms = parse_var("MESH_RETRY_MAX_MS").unwrap_or(DEFAULT_RETRY_MAX_MS);
        let backoff = if base_ms == 0 {
            Backoff::None
        } else {
            Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms.max(base_ms)),
            }
        };
        let heartbeat_secs = parse_var("MESH_HEARTBEAT_SECS")
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        let localhost_only = env::var("MESH_LOCALHOST_ONLY")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false);
        let ice_servers = if localhost_only {
            Vec::new()
        } else {
            match env::var("MESH_ICE_SERVERS") {
                Ok(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(_) => vec![DEFAULT_STUN_SERVER.to_string()],
            }
        };

        Self {
            retry: RetryPolicy {
                max_retries,
                backoff,
            },
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            ice_servers,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target = "mesh", var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
