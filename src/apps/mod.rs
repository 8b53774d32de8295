//! Application registry.
//!
//! An app is the unit of tenancy: it owns a key (used by clients on the
//! handshake), a secret (used to sign private/presence subscriptions) and a
//! small set of limits. Apps are loaded once at startup and never change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

/// A configured application
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub id: String,
    pub key: String,
    pub secret: String,
    /// Maximum simultaneous connections; further handshakes are rejected
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Whether `client-*` events from connections are accepted
    #[serde(default = "default_true")]
    pub enable_client_messages: bool,
    /// Disabled apps behave as if they did not exist
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Client events per second across the app (0 = unlimited)
    #[serde(default = "default_events_per_second")]
    pub max_client_events_per_second: u32,
    /// HTTP-triggered events per second across the app (0 = unlimited)
    #[serde(default = "default_events_per_second")]
    pub max_backend_events_per_second: u32,
    /// HTTP channel queries per second across the app (0 = unlimited)
    #[serde(default = "default_events_per_second")]
    pub max_read_requests_per_second: u32,
}

fn default_max_connections() -> usize {
    10000
}

fn default_true() -> bool {
    true
}

fn default_events_per_second() -> u32 {
    1000
}

impl Default for App {
    fn default() -> Self {
        Self {
            id: "APP-test".to_string(),
            key: "KEY-test".to_string(),
            secret: "SECRET-test".to_string(),
            max_connections: default_max_connections(),
            enable_client_messages: true,
            enabled: true,
            max_client_events_per_second: default_events_per_second(),
            max_backend_events_per_second: default_events_per_second(),
            max_read_requests_per_second: default_events_per_second(),
        }
    }
}

/// Immutable lookup of apps by id and by key
#[derive(Debug, Default)]
pub struct AppManager {
    by_id: HashMap<String, Arc<App>>,
    /// key -> app id
    key_index: HashMap<String, String>,
}

impl AppManager {
    pub fn new(apps: impl IntoIterator<Item = App>) -> Self {
        let mut by_id = HashMap::new();
        let mut key_index = HashMap::new();

        for app in apps {
            if by_id.contains_key(&app.id) {
                tracing::warn!(
                    app_id = %app.id,
                    "Duplicate app id in configuration, keeping the first"
                );
                continue;
            }
            key_index.insert(app.key.clone(), app.id.clone());
            by_id.insert(app.id.clone(), Arc::new(app));
        }

        tracing::info!(apps = by_id.len(), "App manager initialized");

        Self { by_id, key_index }
    }

    /// Find an enabled app by its public key
    pub fn find_by_key(&self, key: &str) -> Option<Arc<App>> {
        self.key_index
            .get(key)
            .and_then(|id| self.find_by_id(id))
    }

    /// Find an enabled app by id
    pub fn find_by_id(&self, id: &str) -> Option<Arc<App>> {
        self.by_id.get(id).filter(|app| app.enabled).cloned()
    }

    pub fn all(&self) -> Vec<Arc<App>> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
