use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

use parley_gateway::RelayConfig;
use parley_gateway::relay::DEFAULT_MAX_BODY_LEN;

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub relay: RelayConfig,
}

impl Config {
    /// Read `PARLEY_*` variables, falling back to development defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = match std::env::var("PARLEY_JWT_SECRET") {
            Ok(secret) => secret,
            Err(_) => {
                warn!("PARLEY_JWT_SECRET not set, using the development secret");
                DEV_SECRET.to_string()
            }
        };
        let db_path = PathBuf::from(var_or("PARLEY_DB_PATH", "parley.db"));
        let host = var_or("PARLEY_HOST", "0.0.0.0");
        let port: u16 = var_or("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let max_body_len = match std::env::var("PARLEY_MAX_BODY_LEN") {
            Ok(raw) => raw
                .parse()
                .context("PARLEY_MAX_BODY_LEN must be a positive integer")?,
            Err(_) => DEFAULT_MAX_BODY_LEN,
        };
        let persist_timeout = match std::env::var("PARLEY_PERSIST_TIMEOUT_MS") {
            Ok(raw) => Some(Duration::from_millis(
                raw.parse()
                    .context("PARLEY_PERSIST_TIMEOUT_MS must be milliseconds")?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            relay: RelayConfig {
                max_body_len,
                persist_timeout,
            },
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}
