//! Game timing and quorum.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the game lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Participant count that starts the countdown. The countdown starts
    /// when the count becomes exactly this value; later joins do not
    /// restart it.
    pub quorum: usize,

    /// How long clients count down before play begins.
    pub countdown: Duration,

    /// How long to wait for scores after play ends.
    pub results_wait: Duration,

    /// Play window for rooms that do not set their own.
    pub default_game_duration: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            quorum: 2,
            countdown: Duration::from_secs(5),
            results_wait: Duration::from_secs(10),
            default_game_duration: Duration::from_secs(30),
        }
    }
}
