// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read from the environment once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATA_DIR` | Directory holding `router.redb` | `/data` |
//! | `POOL_CONFIG` | TOML seed file for models, enclaves and entitlements | unset |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `REAPER_INTERVAL_SECS` | Seconds between stale-assignment sweeps | `300` |
//! | `ASSIGNMENT_STALE_SECS` | Heartbeat age after which an assignment is reaped | `900` |
//! | `ATTESTATION_CACHE_TTL_SECS` | Lifetime of a cached enclave key | `300` |
//! | `ATTESTATION_TIMEOUT_SECS` | Attestation fetch timeout | `5` |
//! | `REQUIRE_HARDWARE_ATTESTATION` | Reject mock attestation reports | `false` |
//! | `BILLING_OVERAGE_URL` | Webhook receiving overage events | unset (log only) |

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::attestation::{AttestationSettings, DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT};
use crate::pool::reaper::{DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL};

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const POOL_CONFIG_ENV: &str = "POOL_CONFIG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const REAPER_INTERVAL_ENV: &str = "REAPER_INTERVAL_SECS";
pub const ASSIGNMENT_STALE_ENV: &str = "ASSIGNMENT_STALE_SECS";
pub const ATTESTATION_CACHE_TTL_ENV: &str = "ATTESTATION_CACHE_TTL_SECS";
pub const ATTESTATION_TIMEOUT_ENV: &str = "ATTESTATION_TIMEOUT_SECS";
pub const REQUIRE_HARDWARE_ENV: &str = "REQUIRE_HARDWARE_ATTESTATION";
pub const BILLING_OVERAGE_URL_ENV: &str = "BILLING_OVERAGE_URL";

/// File name of the pool database inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "router.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub pool_config: Option<PathBuf>,
    pub json_logs: bool,
    pub reaper_interval: Duration,
    pub assignment_stale_after: Duration,
    pub attestation: AttestationSettings,
    pub billing_overage_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_or(&var, PORT_ENV, 8080)?;
        let bind_addr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: HOST_ENV,
                value: host,
            })?;

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&var, name, default.as_secs()).map(Duration::from_secs)
        };

        let require_hardware = match var(REQUIRE_HARDWARE_ENV) {
            None => false,
            Some(v) => parse_flag(&v).ok_or(ConfigError::Invalid {
                name: REQUIRE_HARDWARE_ENV,
                value: v,
            })?,
        };

        Ok(Self {
            bind_addr,
            data_dir: PathBuf::from(var(DATA_DIR_ENV).unwrap_or_else(|| "/data".to_string())),
            pool_config: var(POOL_CONFIG_ENV).map(PathBuf::from),
            json_logs: var(LOG_FORMAT_ENV).is_some_and(|f| f.eq_ignore_ascii_case("json")),
            reaper_interval: secs(REAPER_INTERVAL_ENV, DEFAULT_SWEEP_INTERVAL)?,
            assignment_stale_after: secs(ASSIGNMENT_STALE_ENV, DEFAULT_STALE_AFTER)?,
            attestation: AttestationSettings {
                cache_ttl: secs(ATTESTATION_CACHE_TTL_ENV, DEFAULT_CACHE_TTL)?,
                fetch_timeout: secs(ATTESTATION_TIMEOUT_ENV, DEFAULT_FETCH_TIMEOUT)?,
                require_hardware,
            },
            billing_overage_url: var(BILLING_OVERAGE_URL_ENV),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.database_path(), PathBuf::from("/data/router.redb"));
        assert_eq!(config.pool_config, None);
        assert!(!config.json_logs);
        assert_eq!(config.reaper_interval, Duration::from_secs(300));
        assert_eq!(config.assignment_stale_after, Duration::from_secs(900));
        assert_eq!(config.attestation.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.attestation.fetch_timeout, Duration::from_secs(5));
        assert!(!config.attestation.require_hardware);
        assert_eq!(config.billing_overage_url, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("DATA_DIR", "/var/lib/router"),
            ("POOL_CONFIG", "/etc/router/pool.toml"),
            ("LOG_FORMAT", "JSON"),
            ("REAPER_INTERVAL_SECS", "30"),
            ("REQUIRE_HARDWARE_ATTESTATION", "true"),
            ("BILLING_OVERAGE_URL", "https://billing.internal/overage"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/router/router.redb"));
        assert_eq!(config.pool_config, Some(PathBuf::from("/etc/router/pool.toml")));
        assert!(config.json_logs);
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert!(config.attestation.require_hardware);
        assert_eq!(
            config.billing_overage_url.as_deref(),
            Some("https://billing.internal/overage")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "http")]),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("REQUIRE_HARDWARE_ATTESTATION", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config_from(&[("HOST", "not a host")]),
            Err(ConfigError::Invalid { name: "HOST", .. })
        ));
    }
}
