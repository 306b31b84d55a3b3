//! Per-home freshness window
//!
//! A home is fresh while `now - last_refreshed <= window`. Timestamps use the
//! tokio clock so paused-time tests can step across the window boundary.

use crate::client::HomeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Hit/miss counters for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FreshnessStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl FreshnessStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct State {
    refreshed_at: HashMap<HomeId, Instant>,
    stats: FreshnessStats,
}

/// Freshness record for every home
#[derive(Debug)]
pub struct FreshnessCache {
    window: Duration,
    state: Mutex<State>,
}

impl FreshnessCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(State::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether cached data for the home can be served without a fetch
    pub fn is_fresh(&self, home_id: HomeId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = state
            .refreshed_at
            .get(&home_id)
            .is_some_and(|at| at.elapsed() <= self.window);

        if fresh {
            state.stats.hits += 1;
            trace!("Home {home_id} is fresh");
        } else {
            state.stats.misses += 1;
            trace!("Home {home_id} is stale");
        }
        fresh
    }

    /// Time left before the home goes stale
    pub fn remaining(&self, home_id: HomeId) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .refreshed_at
            .get(&home_id)
            .map(|at| self.window.saturating_sub(at.elapsed()))
    }

    /// Stamp the home as refreshed now
    pub fn mark_refreshed(&self, home_id: HomeId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refreshed_at.insert(home_id, Instant::now());
    }

    /// Force the next read of this home through a real refresh
    pub fn invalidate(&self, home_id: HomeId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.refreshed_at.remove(&home_id).is_some() {
            state.stats.invalidations += 1;
            debug!("Invalidated freshness for home {home_id}");
        }
    }

    /// Force every home stale
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let cleared = state.refreshed_at.len() as u64;
        state.refreshed_at.clear();
        state.stats.invalidations += cleared;
        debug!("Invalidated freshness for {cleared} homes");
    }

    pub fn stats(&self) -> FreshnessStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }
}
