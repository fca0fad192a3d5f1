//! Respawn crash-loop detection
//!
//! A zygote that keeps dying right after injection respawns quickly; left
//! alone that turns into an endless kill/inject cycle. Each respawn is
//! recorded in a sliding window, and crossing the threshold halts all
//! injection until an explicit start request.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RESPAWN_LIMIT: usize = 5;
pub const RESPAWN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct CrashWindow {
    limit: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl Default for CrashWindow {
    fn default() -> Self {
        Self::new(RESPAWN_LIMIT, RESPAWN_WINDOW)
    }
}

impl CrashWindow {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window, events: VecDeque::new() }
    }

    /// Record a respawn at `now`. Returns true when the threshold is hit.
    pub fn record(&mut self, now: Instant) -> bool {
        self.events.push_back(now);
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() >= self.limit
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }
}
