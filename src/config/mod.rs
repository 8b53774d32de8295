mod settings;

pub use settings::{
    ApiConfig, LoggingConfig, RelayConfig, ServerConfig, Settings, WebSocketConfig,
};
