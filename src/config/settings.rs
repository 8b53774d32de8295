use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::apps::App;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default = "default_apps")]
    pub apps: Vec<App>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Activity timeout advertised to clients in `pusher:connection_established` (seconds)
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout: u64,
    /// Heartbeat interval in seconds (server sends pusher:ping to idle connections)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Bounded outbound queue per connection; overflow disconnects the connection
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Maximum inbound frame size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_activity_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    120 // 2 minutes
}

fn default_cleanup_interval() -> u64 {
    15
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_max_message_size() -> usize {
    100 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Key required in `X-API-Key` for the `/apps/...` HTTP API. Unset means open.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// App the relay publishes into; defaults to the first configured app
    pub app_id: Option<String>,
    #[serde(default = "default_relay_channel")]
    pub channel: String,
    #[serde(default = "default_relay_event")]
    pub event: String,
    /// Publish a demo message on the relay channel at this interval
    pub demo_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_true() -> bool {
    true
}

fn default_relay_channel() -> String {
    "test-channel".to_string()
}

fn default_relay_event() -> String {
    "new-message".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_apps() -> Vec<App> {
    vec![App::default()]
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let port_override = env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .map(i64::from);

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 6001)?
            .set_default("websocket.activity_timeout", 30)?
            .set_default("websocket.heartbeat_interval", 30)?
            .set_default("websocket.connection_timeout", 120)?
            .set_default("websocket.cleanup_interval", 15)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // BROKER_SERVER__PORT, BROKER_API__KEY, BROKER_RELAY__CHANNEL, ...
            .add_source(
                Environment::with_prefix("BROKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            )
            .set_override_option("server.port", port_override)?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.apps.is_empty() {
            return Err(ConfigError::Message("at least one app must be configured".into()));
        }
        for app in &self.apps {
            if app.id.is_empty() || app.key.is_empty() || app.secret.is_empty() {
                return Err(ConfigError::Message(format!(
                    "app '{}' must have a non-empty id, key and secret",
                    app.id
                )));
            }
        }
        if self.websocket.outbound_buffer == 0 {
            return Err(ConfigError::Message("websocket.outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// App the relay publishes into
    pub fn relay_app_id(&self) -> Option<String> {
        self.relay
            .app_id
            .clone()
            .or_else(|| self.apps.first().map(|a| a.id.clone()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            websocket: WebSocketConfig::default(),
            apps: default_apps(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            activity_timeout: default_activity_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_id: None,
            channel: default_relay_channel(),
            event: default_relay_event(),
            demo_interval_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
