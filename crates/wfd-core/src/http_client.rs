//! Connection-level settings for the runtime transport. Per-request deadlines
//! (attempt timeout, probe timeout) are set by `RuntimeClient` on each call.

use std::time::Duration;

use crate::error::ClientError;

const CONNECT_TIMEOUT_ENV: &str = "WFD_HTTP_CONNECT_TIMEOUT_SECS";
const KEEPALIVE_ENV: &str = "WFD_HTTP_TCP_KEEPALIVE_SECS";
const POOL_IDLE_ENV: &str = "WFD_HTTP_POOL_IDLE_SECS";

/// Socket tuning for the shared runtime connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTuning {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Duration::from_secs(60),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ConnectionTuning {
    /// Defaults overridden by `WFD_HTTP_*_SECS`. Unparsable values keep the
    /// default; zero is raised to one second.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            connect_timeout: secs_from_env(CONNECT_TIMEOUT_ENV, base.connect_timeout),
            tcp_keepalive: secs_from_env(KEEPALIVE_ENV, base.tcp_keepalive),
            pool_idle_timeout: secs_from_env(POOL_IDLE_ENV, base.pool_idle_timeout),
        }
    }
}

fn secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(default)
}

fn user_agent() -> String {
    format!("wfd/{}", env!("CARGO_PKG_VERSION"))
}

pub fn build_client_with(tuning: ConnectionTuning) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(tuning.connect_timeout)
        .tcp_keepalive(tuning.tcp_keepalive)
        .pool_idle_timeout(tuning.pool_idle_timeout)
        .build()
        .map_err(|err| ClientError::Build(err.to_string()))
}

pub fn build_client() -> Result<reqwest::Client, ClientError> {
    build_client_with(ConnectionTuning::from_env())
}
