use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use lib_bridge::ingestors::{PortalConfig, SessionConfig};
use lib_bridge::{BlackoutSettings, BridgeSettings, ReconnectPolicy, TransportMode};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Portfolio greeks bridge daemon", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GREEKS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GREEKS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GREEKS_LOG_LEVEL", help = "Logging level when RUST_LOG is unset (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "GREEKS_TRANSPORT", help = "Upstream transport: socket or portal.")]
    pub transport: Option<String>,

    #[clap(long, env = "GREEKS_GATEWAY_URL", help = "WebSocket URL of the local session gateway.")]
    pub gateway_url: Option<String>,

    #[clap(long, env = "GREEKS_PORTAL_URL", help = "Base URL of the REST portal API.")]
    pub portal_url: Option<String>,

    #[clap(long, env = "GREEKS_ACCOUNT_ID", help = "Portal account id. Resolved from the portal when unset.")]
    pub account_id: Option<String>,

    #[clap(long, env = "GREEKS_PORTAL_ACCEPT_INVALID_CERTS", help = "Accept the portal's self-signed certificate (true/false).")]
    pub portal_accept_invalid_certs: Option<bool>,

    #[clap(long, env = "GREEKS_DATABASE_URL", help = "PostgreSQL URL of the destination store.")]
    pub database_url: Option<String>,

    #[clap(long, env = "GREEKS_DB_MAX_CONNECTIONS", help = "Maximum pooled store connections.")]
    pub db_max_connections: Option<usize>,

    #[clap(long, env = "GREEKS_BUFFER_PATH", help = "Offline buffer file for writes pending delivery.")]
    pub buffer_path: Option<PathBuf>,

    #[clap(long, env = "GREEKS_SNAPSHOT_INTERVAL_SECONDS", help = "Seconds between portfolio snapshots.")]
    pub snapshot_interval_seconds: Option<u64>,

    #[clap(long, env = "GREEKS_WATCHDOG_INTERVAL_SECONDS", help = "Seconds between connection checks.")]
    pub watchdog_interval_seconds: Option<u64>,

    #[clap(long, env = "GREEKS_FLUSH_INTERVAL_SECONDS", help = "Seconds between offline buffer flush attempts.")]
    pub flush_interval_seconds: Option<u64>,

    #[clap(long, env = "GREEKS_GREEKS_TIMEOUT_MS", help = "Milliseconds to wait for model greeks to populate.")]
    pub greeks_timeout_ms: Option<u64>,

    #[clap(long, env = "GREEKS_WRITE_TIMEOUT_MS", help = "Milliseconds before a store write counts as failed.")]
    pub write_timeout_ms: Option<u64>,

    #[clap(long, env = "GREEKS_FAILURE_THRESHOLD", help = "Consecutive store failures that open the circuit breaker.")]
    pub failure_threshold: Option<u32>,

    #[clap(long, env = "GREEKS_RECONNECT_DELAYS_SECONDS", help = "Comma-separated reconnect delays in seconds, e.g. 2,5,10,20.")]
    pub reconnect_delays_seconds: Option<String>,

    #[clap(long, env = "GREEKS_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts per disconnect episode.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "GREEKS_BLACKOUT_TIME_ZONE", help = "IANA time zone of the blackout window.")]
    pub blackout_time_zone: Option<String>,

    #[clap(long, env = "GREEKS_BLACKOUT_START", help = "Blackout window start, HH:MM.")]
    pub blackout_start: Option<String>,

    #[clap(long, env = "GREEKS_BLACKOUT_END", help = "Blackout window end, HH:MM.")]
    pub blackout_end: Option<String>,

    #[clap(long, env = "GREEKS_BLACKOUT_GRACE_SECONDS", help = "Seconds to wait after the window closes before reconnecting.")]
    pub blackout_grace_seconds: Option<u64>,
}

impl Config {
    /// Built-in defaults, the bottom layer.
    pub fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            transport: Some("socket".to_string()),
            gateway_url: Some(SessionConfig::default().gateway_url),
            portal_url: Some(PortalConfig::default().base_url),
            portal_accept_invalid_certs: Some(true),
            db_max_connections: Some(4),
            buffer_path: Some(PathBuf::from("./data/greeks_buffer.jsonl")),
            snapshot_interval_seconds: Some(5),
            watchdog_interval_seconds: Some(30),
            flush_interval_seconds: Some(60),
            greeks_timeout_ms: Some(3000),
            write_timeout_ms: Some(5000),
            failure_threshold: Some(3),
            reconnect_delays_seconds: Some("2,5,10,20".to_string()),
            reconnect_max_attempts: Some(5),
            blackout_time_zone: Some("America/New_York".to_string()),
            blackout_start: Some("23:45".to_string()),
            blackout_end: Some("00:45".to_string()),
            blackout_grace_seconds: Some(120),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            transport: other.transport.or(self.transport),
            gateway_url: other.gateway_url.or(self.gateway_url),
            portal_url: other.portal_url.or(self.portal_url),
            account_id: other.account_id.or(self.account_id),
            portal_accept_invalid_certs: other.portal_accept_invalid_certs.or(self.portal_accept_invalid_certs),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            buffer_path: other.buffer_path.or(self.buffer_path),
            snapshot_interval_seconds: other.snapshot_interval_seconds.or(self.snapshot_interval_seconds),
            watchdog_interval_seconds: other.watchdog_interval_seconds.or(self.watchdog_interval_seconds),
            flush_interval_seconds: other.flush_interval_seconds.or(self.flush_interval_seconds),
            greeks_timeout_ms: other.greeks_timeout_ms.or(self.greeks_timeout_ms),
            write_timeout_ms: other.write_timeout_ms.or(self.write_timeout_ms),
            failure_threshold: other.failure_threshold.or(self.failure_threshold),
            reconnect_delays_seconds: other.reconnect_delays_seconds.or(self.reconnect_delays_seconds),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            blackout_time_zone: other.blackout_time_zone.or(self.blackout_time_zone),
            blackout_start: other.blackout_start.or(self.blackout_start),
            blackout_end: other.blackout_end.or(self.blackout_end),
            blackout_grace_seconds: other.blackout_grace_seconds.or(self.blackout_grace_seconds),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("no destination store configured (--database-url or GREEKS_DATABASE_URL)"))
    }

    pub fn db_max_connections(&self) -> usize {
        self.db_max_connections.unwrap_or(4)
    }

    fn greeks_timeout(&self) -> Result<Duration> {
        required(&self.greeks_timeout_ms, "greeks_timeout_ms").map(Duration::from_millis)
    }

    /// Resolves the core settings. Bad transport names, time zones, or
    /// `HH:MM` bounds are fatal.
    pub fn bridge_settings(&self) -> Result<BridgeSettings> {
        let mode: TransportMode = required(&self.transport, "transport")?
            .parse()
            .context("invalid transport selection")?;

        let delays = parse_delays(&required(&self.reconnect_delays_seconds, "reconnect_delays_seconds")?)?;
        let reconnect = ReconnectPolicy::new(delays, required(&self.reconnect_max_attempts, "reconnect_max_attempts")?)
            .context("invalid reconnect policy")?;

        let blackout = BlackoutSettings::parse(
            &required(&self.blackout_time_zone, "blackout_time_zone")?,
            &required(&self.blackout_start, "blackout_start")?,
            &required(&self.blackout_end, "blackout_end")?,
            Duration::from_secs(required(&self.blackout_grace_seconds, "blackout_grace_seconds")?),
        )
        .context("invalid blackout window")?;

        Ok(BridgeSettings {
            mode,
            snapshot_interval: Duration::from_secs(required(&self.snapshot_interval_seconds, "snapshot_interval_seconds")?),
            watchdog_interval: Duration::from_secs(required(&self.watchdog_interval_seconds, "watchdog_interval_seconds")?),
            flush_interval: Duration::from_secs(required(&self.flush_interval_seconds, "flush_interval_seconds")?),
            failure_threshold: required(&self.failure_threshold, "failure_threshold")?,
            write_timeout: Duration::from_millis(required(&self.write_timeout_ms, "write_timeout_ms")?),
            buffer_path: required(&self.buffer_path, "buffer_path")?,
            reconnect,
            blackout,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            gateway_url: required(&self.gateway_url, "gateway_url")?,
            greeks_timeout: self.greeks_timeout()?,
            ..SessionConfig::default()
        })
    }

    pub fn portal_config(&self) -> Result<PortalConfig> {
        Ok(PortalConfig {
            base_url: required(&self.portal_url, "portal_url")?,
            account_id: self.account_id.clone(),
            greeks_timeout: self.greeks_timeout()?,
            accept_invalid_certs: self.portal_accept_invalid_certs.unwrap_or(true),
            ..PortalConfig::default()
        })
    }
}

fn required<T: Clone>(value: &Option<T>, name: &str) -> Result<T> {
    value.clone().ok_or_else(|| anyhow!("missing setting: {name}"))
}

fn parse_delays(raw: &str) -> Result<Vec<Duration>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("invalid reconnect delay '{s}'"))
        })
        .collect()
}

/// Layers defaults, the JSON config file, then environment and CLI.
pub fn load_config() -> Config {
    // .env first so clap sees its variables
    dotenvy::dotenv().ok();
    resolve(Config::parse())
}

fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_greeks.conf"));

    let mut current_config = Config::defaults();

    // The subscriber is not installed yet, so problems go to stderr.
    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {e}. Falling back to other sources.",
                    config_file_path.display()
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {e}. Falling back to other sources.",
                config_file_path.display()
            ),
        }
    }

    current_config.merge(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_resolve_to_the_documented_settings() {
        let settings = Config::defaults().bridge_settings().unwrap();
        let expected = BridgeSettings {
            buffer_path: PathBuf::from("./data/greeks_buffer.jsonl"),
            ..BridgeSettings::default()
        };
        assert_eq!(settings.mode, expected.mode);
        assert_eq!(settings.snapshot_interval, expected.snapshot_interval);
        assert_eq!(settings.watchdog_interval, expected.watchdog_interval);
        assert_eq!(settings.flush_interval, expected.flush_interval);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.write_timeout, Duration::from_secs(5));
        assert_eq!(settings.reconnect, expected.reconnect);
        assert_eq!(settings.blackout, expected.blackout);
        assert_eq!(settings.buffer_path, expected.buffer_path);
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_greeks.conf");
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"transport": "portal", "accountId": "U1234567", "snapshotIntervalSeconds": 10}}"#
        )
        .unwrap();

        let cli = Config::try_parse_from([
            "server_greeks",
            "--config-path",
            path.to_str().unwrap(),
            "--snapshot-interval-seconds",
            "15",
        ])
        .unwrap();
        let config = resolve(cli);

        assert_eq!(config.transport.as_deref(), Some("portal"));
        assert_eq!(config.account_id.as_deref(), Some("U1234567"));
        assert_eq!(config.snapshot_interval_seconds, Some(15));
        assert_eq!(config.flush_interval_seconds, Some(60));

        let settings = config.bridge_settings().unwrap();
        assert_eq!(settings.mode, TransportMode::Portal);
        assert_eq!(settings.snapshot_interval, Duration::from_secs(15));
        assert_eq!(config.portal_config().unwrap().account_id.as_deref(), Some("U1234567"));
    }

    #[test]
    fn invalid_values_are_fatal() {
        let bad_mode = Config {
            transport: Some("fax".to_string()),
            ..Config::defaults()
        };
        assert!(bad_mode.bridge_settings().is_err());

        let bad_zone = Config {
            blackout_time_zone: Some("Mars/Olympus_Mons".to_string()),
            ..Config::defaults()
        };
        assert!(bad_zone.bridge_settings().is_err());

        let bad_bound = Config {
            blackout_start: Some("25:99".to_string()),
            ..Config::defaults()
        };
        assert!(bad_bound.bridge_settings().is_err());

        let bad_delay = Config {
            reconnect_delays_seconds: Some("2,five".to_string()),
            ..Config::defaults()
        };
        assert!(bad_delay.bridge_settings().is_err());
    }

    #[test]
    fn database_url_is_required() {
        assert!(Config::defaults().database_url().is_err());
        let config = Config {
            database_url: Some("postgres://bridge@localhost/risk".to_string()),
            ..Config::defaults()
        };
        assert_eq!(config.database_url().unwrap(), "postgres://bridge@localhost/risk");
    }
}
