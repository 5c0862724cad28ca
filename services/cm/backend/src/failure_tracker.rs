//! Construction failure tracker for detecting an unavailable backend

use std::sync::Mutex;
use tracing::{debug, warn};

/// Consecutive failures that, with no live worker, mean the backend is gone
pub const UNAVAILABLE_THRESHOLD: u32 = 2;

/// Counts consecutive worker construction failures
#[derive(Debug, Default)]
pub struct ConstructionFailureTracker {
    /// Failures since the last successful construction
    consecutive: Mutex<u32>,
}

impl ConstructionFailureTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed construction while `live_workers` workers are alive.
    ///
    /// Returns the failure count and whether the backend should now be treated
    /// as unavailable. That happens exactly when this is the second consecutive
    /// failure and no worker is alive; the counter then starts over.
    pub fn record_failure(&self, live_workers: usize) -> (u32, bool) {
        let mut consecutive = self
            .consecutive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *consecutive += 1;
        let count = *consecutive;

        let unavailable = count == UNAVAILABLE_THRESHOLD && live_workers == 0;
        if unavailable {
            warn!(
                "Backend unavailable after {} consecutive connection failures",
                count
            );
            *consecutive = 0;
        }

        debug!(
            "Recorded backend construction failure (count: {}, live workers: {})",
            count, live_workers
        );
        (count, unavailable)
    }

    /// Record a successful construction (clears the failure count)
    pub fn record_success(&self) -> u32 {
        let mut consecutive = self
            .consecutive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = *consecutive;
        if previous > 0 {
            debug!("Backend reachable again after {} failures", previous);
        }
        *consecutive = 0;
        previous
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        *self
            .consecutive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
