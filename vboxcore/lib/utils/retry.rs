use std::{future::Future, time::Duration};

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MIN_INTERVAL: Duration = Duration::from_millis(1);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `probe` on a fixed `interval` ticker until it returns `true` or `timeout` elapses.
///
/// Probes start `interval` apart however long each one takes. A probe that overruns its slot
/// delays the next tick rather than causing a burst. Returns whether the probe succeeded. A probe
/// still running at the deadline is abandoned, so the call returns within `timeout` plus
/// scheduling jitter.
pub async fn retry_until<F, Fut>(interval: Duration, timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut ticker = poll_ticker(interval);

    loop {
        if time::timeout_at(deadline, ticker.tick()).await.is_err() {
            return false;
        }

        match time::timeout_at(deadline, probe()).await {
            Ok(true) => return true,
            Ok(false) if Instant::now() < deadline => {}
            _ => return false,
        }
    }
}

/// A ticker whose first tick completes immediately and whose missed ticks are delayed, not
/// bunched.
pub fn poll_ticker(interval: Duration) -> Interval {
    let mut ticker = time::interval(interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
