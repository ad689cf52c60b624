use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

#[cfg(feature = "dispatch")]
use crate::dispatch::{Position, SessionSettings, StaticSession};
#[cfg(feature = "dispatch")]
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "dispatch_client.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Ride dispatch console client", version)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[clap(long, env = "DISPATCH_API_URL", help = "Base URL of the dispatch REST API.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "DISPATCH_WS_URL", help = "Base WebSocket endpoint of the dispatch server.")]
    pub ws_endpoint: Option<String>,

    #[clap(long, env = "DISPATCH_TOKEN", help = "Bearer token of the signed-in user.")]
    pub token: Option<String>,

    #[clap(long, env = "DISPATCH_USER_ID", help = "Id of the signed-in user.")]
    pub user_id: Option<i64>,

    #[clap(long, env = "DISPATCH_DRIVER_ID", help = "Driver id, if already known.")]
    pub driver_id: Option<i64>,

    #[clap(long, env = "DISPATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DISPATCH_POLL_INTERVAL_MS", help = "Ride card poll interval in milliseconds.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "DISPATCH_ONLINE_TELEMETRY_SECONDS", help = "Location update period while online.")]
    pub online_telemetry_seconds: Option<u64>,

    #[clap(long, env = "DISPATCH_RIDE_TELEMETRY_SECONDS", help = "Location ping period during a ride.")]
    pub ride_telemetry_seconds: Option<u64>,

    #[clap(long, env = "DISPATCH_HANDSHAKE_TIMEOUT_SECONDS", help = "Seconds to wait for the STOMP CONNECTED frame.")]
    pub handshake_timeout_seconds: Option<u64>,

    #[clap(long, env = "DISPATCH_OFFER_TTL_SECONDS", help = "Seconds before an unanswered offer is dropped.")]
    pub offer_ttl_seconds: Option<u64>,

    #[clap(long, env = "DISPATCH_DEVICE_LAT", help = "Latitude reported as the device position.")]
    pub device_lat: Option<f64>,

    #[clap(long, env = "DISPATCH_DEVICE_LNG", help = "Longitude reported as the device position.")]
    pub device_lng: Option<f64>,
}

impl ClientConfig {
    pub fn defaults() -> Self {
        Self {
            api_base_url: Some("http://localhost:9090/".to_string()),
            ws_endpoint: Some("ws://localhost:9090".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            poll_interval_ms: Some(3000),
            online_telemetry_seconds: Some(5),
            ride_telemetry_seconds: Some(5),
            handshake_timeout_seconds: Some(10),
            offer_ttl_seconds: Some(30),
            ..Default::default()
        }
    }

    // 'other' wins wherever it has a value
    pub fn merge(self, other: ClientConfig) -> ClientConfig {
        ClientConfig {
            api_base_url: other.api_base_url.or(self.api_base_url),
            ws_endpoint: other.ws_endpoint.or(self.ws_endpoint),
            token: other.token.or(self.token),
            user_id: other.user_id.or(self.user_id),
            driver_id: other.driver_id.or(self.driver_id),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            online_telemetry_seconds: other.online_telemetry_seconds.or(self.online_telemetry_seconds),
            ride_telemetry_seconds: other.ride_telemetry_seconds.or(self.ride_telemetry_seconds),
            handshake_timeout_seconds: other.handshake_timeout_seconds.or(self.handshake_timeout_seconds),
            offer_ttl_seconds: other.offer_ttl_seconds.or(self.offer_ttl_seconds),
            device_lat: other.device_lat.or(self.device_lat),
            device_lng: other.device_lng.or(self.device_lng),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Timing knobs for a session. Unset and zero values keep the session
    /// defaults.
    #[cfg(feature = "dispatch")]
    pub fn settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            ws_endpoint: self.ws_endpoint.clone().unwrap_or(defaults.ws_endpoint),
            handshake_timeout: positive(
                "handshakeTimeoutSeconds",
                self.handshake_timeout_seconds.map(Duration::from_secs),
                defaults.handshake_timeout,
            ),
            poll_interval: positive(
                "pollIntervalMs",
                self.poll_interval_ms.map(Duration::from_millis),
                defaults.poll_interval,
            ),
            online_telemetry: positive(
                "onlineTelemetrySeconds",
                self.online_telemetry_seconds.map(Duration::from_secs),
                defaults.online_telemetry,
            ),
            ride_telemetry: positive(
                "rideTelemetrySeconds",
                self.ride_telemetry_seconds.map(Duration::from_secs),
                defaults.ride_telemetry,
            ),
            offer_ttl: positive(
                "offerTtlSeconds",
                self.offer_ttl_seconds.map(Duration::from_secs),
                defaults.offer_ttl,
            ),
            expiry_sweep: defaults.expiry_sweep,
        }
    }

    #[cfg(feature = "dispatch")]
    pub fn session_store(&self) -> StaticSession {
        StaticSession::new(self.token.clone(), self.user_id, self.driver_id)
    }

    /// The configured device position; both coordinates must be set.
    #[cfg(feature = "dispatch")]
    pub fn device_position(&self) -> Option<Position> {
        Some(Position::new(self.device_lat?, self.device_lng?))
    }
}

#[cfg(feature = "dispatch")]
fn positive(name: &str, configured: Option<Duration>, default: Duration) -> Duration {
    match configured {
        Some(d) if d.is_zero() => {
            log::warn!("{} must be greater than zero; using {:?}", name, default);
            default
        }
        Some(d) => d,
        None => default,
    }
}

/// Loads the configuration from the process arguments and environment.
pub fn load_config() -> ClientConfig {
    load_config_from(std::env::args_os())
}

/// Defaults, then the JSON file (from `--config-path` or
/// `dispatch_client.conf`), then environment and flags.
pub fn load_config_from<I, T>(args: I) -> ClientConfig
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = ClientConfig::parse_from(args);
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = ClientConfig::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        config = config.merge(file_config);
    }
    config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<ClientConfig> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<ClientConfig>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!(
                "Failed to parse config file {}: {}. Falling back to other sources.",
                path.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn flags_beat_file_and_file_beats_defaults() {
        let file = config_file(r#"{"logLevel":"warn","pollIntervalMs":1500,"userId":12}"#);
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config_from([
            "driver_client",
            "--config-path",
            path.as_str(),
            "--log-level",
            "debug",
        ]);

        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.poll_interval_ms, Some(1500));
        assert_eq!(config.user_id, Some(12));
        assert_eq!(config.offer_ttl_seconds, Some(30));
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let file = config_file("{ not json");
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config_from(["rider_client", "--config-path", path.as_str()]);
        assert_eq!(config.poll_interval_ms, Some(3000));

        let missing = load_config_from(["rider_client", "--config-path", "/nonexistent/x.conf"]);
        assert_eq!(missing.ws_endpoint.as_deref(), Some("ws://localhost:9090"));
    }

    #[test]
    fn merge_keeps_values_the_override_lacks() {
        let base = ClientConfig {
            token: Some("abc".into()),
            driver_id: Some(4),
            ..ClientConfig::default()
        };
        let merged = base.merge(ClientConfig {
            driver_id: Some(9),
            ..ClientConfig::default()
        });
        assert_eq!(merged.token.as_deref(), Some("abc"));
        assert_eq!(merged.driver_id, Some(9));
    }

    #[cfg(feature = "dispatch")]
    #[test]
    fn settings_follow_configured_periods() {
        let config = ClientConfig {
            poll_interval_ms: Some(250),
            ride_telemetry_seconds: Some(2),
            ..ClientConfig::defaults()
        };
        let settings = config.settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.ride_telemetry, Duration::from_secs(2));
        assert_eq!(settings.online_telemetry, Duration::from_secs(5));

        assert_eq!(config.device_position(), None);
        let placed = ClientConfig {
            device_lat: Some(28.6),
            device_lng: Some(77.2),
            ..config
        };
        assert_eq!(placed.device_position(), Some(Position::new(28.6, 77.2)));
    }

    #[cfg(feature = "dispatch")]
    #[test]
    fn zero_periods_fall_back_to_defaults() {
        let config = ClientConfig {
            poll_interval_ms: Some(0),
            online_telemetry_seconds: Some(0),
            ride_telemetry_seconds: Some(0),
            handshake_timeout_seconds: Some(0),
            offer_ttl_seconds: Some(0),
            ..ClientConfig::defaults()
        };
        let settings = config.settings();
        let defaults = SessionSettings::default();
        assert_eq!(settings.poll_interval, defaults.poll_interval);
        assert_eq!(settings.online_telemetry, defaults.online_telemetry);
        assert_eq!(settings.ride_telemetry, defaults.ride_telemetry);
        assert_eq!(settings.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(settings.offer_ttl, defaults.offer_ttl);
    }
}
