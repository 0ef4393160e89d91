use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for stream subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// How long one blocking read waits for new entries before the
    /// reader loops and checks for cancellation again.
    pub poll_interval: Duration,

    /// Decoded entries buffered between the reader task and the
    /// subscriber.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            channel_capacity: 32,
        }
    }
}
