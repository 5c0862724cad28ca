//! Whitespace heartbeat for backend links.
//!
//! The backend drops component connections it has not heard from; a single
//! space between stanzas is valid stream content and keeps them open.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

use crate::worker::WorkerHandle;

/// Heartbeat payload
pub const HEARTBEAT: &str = " ";

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Send one heartbeat on every valid worker; returns how many were sent
pub fn send_heartbeats<'a, I>(workers: I) -> usize
where
    I: IntoIterator<Item = &'a WorkerHandle>,
{
    let mut sent = 0;
    for worker in workers {
        if worker.is_valid() && worker.send_raw(HEARTBEAT.to_string()) {
            sent += 1;
        }
    }
    trace!("Sent {} backend heartbeats", sent);
    sent
}

/// Tick every `period`, calling `beat` each time, until `beat` returns false
pub async fn run_heartbeat<F>(period: Duration, mut beat: F)
where
    F: FnMut() -> bool,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !beat() {
            break;
        }
    }
}
