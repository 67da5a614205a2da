use std::time::Duration;

use crate::error::{Error, Result};

/// Where the sync driver pulls user data from.
#[derive(Debug, Clone)]
pub enum SyncSource {
    Json { path: String },
    Remote { endpoint: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub sync_source: SyncSource,
    pub sync_period: Duration,
    pub log_level: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub metrics_port: Option<u16>,
    pub idle_timeout: Duration,
    pub tcp_conn_limit: u32,
}

impl Config {
    /// Builds configuration from the process environment, per the env-var
    /// table. Fails fast on malformed (not merely missing) values.
    pub fn from_env() -> Result<Self> {
        let listen_host = env_or("SS_LISTEN_HOST", "0.0.0.0");

        let sync_source = match std::env::var("SS_API_ENDPOINT") {
            Ok(endpoint) if !endpoint.is_empty() => SyncSource::Remote { endpoint },
            _ => SyncSource::Json {
                path: "userconfigs.json".to_string(),
            },
        };

        let sync_period = Duration::from_secs(parse_env_or("SS_SYNC_TIME", 60)?);
        let log_level = env_or("SS_LOG_LEVEL", "info");

        let rpc_host = env_or("SS_GRPC_HOST", "127.0.0.1");
        let rpc_port = parse_env_or("SS_GRPC_PORT", 6001)?;

        let metrics_port = match std::env::var("SS_METRICS_PORT") {
            Ok(v) if !v.is_empty() => Some(v.parse::<u16>().map_err(|e| {
                Error::Configuration(format!("SS_METRICS_PORT invalid: {e}"))
            })?),
            _ => None,
        };

        let idle_timeout = Duration::from_secs(parse_env_or("SS_TIME_OUT_LIMIT", 60)?);
        let tcp_conn_limit = parse_env_or("SS_TCP_CONN_LIMIT", 60)?;

        Ok(Config {
            listen_host,
            sync_source,
            sync_period,
            log_level,
            rpc_host,
            rpc_port,
            metrics_port,
            idle_timeout,
            tcp_conn_limit,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<T>()
            .map_err(|e| Error::Configuration(format!("{key} invalid: {e}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_ss_env() {
        for key in [
            "SS_LISTEN_HOST",
            "SS_API_ENDPOINT",
            "SS_SYNC_TIME",
            "SS_LOG_LEVEL",
            "SS_GRPC_HOST",
            "SS_GRPC_PORT",
            "SS_METRICS_PORT",
            "SS_TIME_OUT_LIMIT",
            "SS_TCP_CONN_LIMIT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_to_json_mode() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_ss_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.listen_host, "0.0.0.0");
        assert!(matches!(cfg.sync_source, SyncSource::Json { .. }));
        assert_eq!(cfg.sync_period, Duration::from_secs(60));
        assert_eq!(cfg.tcp_conn_limit, 60);
    }

    #[test]
    fn remote_endpoint_selects_remote_mode() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_ss_env();
        std::env::set_var("SS_API_ENDPOINT", "http://example.test/api");
        let cfg = Config::from_env().unwrap();
        assert!(matches!(cfg.sync_source, SyncSource::Remote { .. }));
        std::env::remove_var("SS_API_ENDPOINT");
    }

    #[test]
    fn invalid_port_is_configuration_error() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_ss_env();
        std::env::set_var("SS_GRPC_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        std::env::remove_var("SS_GRPC_PORT");
    }
}
