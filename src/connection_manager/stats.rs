//! Connection statistics

use serde::Serialize;
use std::collections::HashMap;

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    /// app_id -> open connections
    pub apps: HashMap<String, usize>,
    pub occupied_channels: usize,
}
