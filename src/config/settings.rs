use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Connection registry and request relay tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// How long a lost tenant connection may stay away before loss handling runs
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Upper bound on a single recovery attempt
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// How long a relayed request waits for its next event
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Outbound frame buffer per connection
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Shell command run to recover a lost tenant session (RELAY_TENANT is set)
    #[serde(default)]
    pub recovery_command: Option<String>,
    /// Treat every tenant as having a live session unless it was retired
    #[serde(default = "default_true")]
    pub assume_live_sessions: bool,
}

impl RelayConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Emit logs as JSON lines instead of the human readable format
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_recovery_timeout_ms() -> u64 {
    55_000
}

fn default_request_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "tenant-relay".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("relay.grace_period_ms", default_grace_period_ms() as i64)?
            .set_default("relay.recovery_timeout_ms", default_recovery_timeout_ms() as i64)?
            .set_default("relay.request_timeout_secs", default_request_timeout_secs() as i64)?
            .set_default("websocket.heartbeat_interval", default_heartbeat_interval() as i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // RELAY__SERVER__PORT, RELAY__RELAY__GRACE_PERIOD_MS, RELAY__OTEL__ENABLED, ...
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
            recovery_command: None,
            assume_live_sessions: true,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
