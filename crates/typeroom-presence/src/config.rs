use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for presence tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// How long a connection counts as live after it was added or last
    /// refreshed.
    pub connection_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            connection_ttl: Duration::from_secs(10 * 60),
        }
    }
}
