// Ambient stack
pub mod config;
pub mod error;
pub mod telemetry;

// Broker core
pub mod apps;
pub mod auth;
pub mod channel;
pub mod connection_manager;
pub mod publish;
pub mod ratelimit;
pub mod router;

// Transport and HTTP surface
pub mod api;
pub mod relay;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
