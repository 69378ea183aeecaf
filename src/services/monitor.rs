//! Row count watcher
//!
//! Re-polls the store's exact count on an interval and logs the change
//! since the previous poll. Count errors are logged and polling continues.

use crate::io::store::{CountStore, RecordFilter};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// One successful count read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSample {
    pub poll: u64,
    pub count: u64,
    /// Change since the previous successful read
    pub delta: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub polls: u64,
    pub errors: u64,
    pub first: Option<u64>,
    pub last: Option<u64>,
}

impl WatchSummary {
    /// Net change between the first and last successful reads
    pub fn net_change(&self) -> i64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => last as i64 - first as i64,
            _ => 0,
        }
    }
}

const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Poll `count` until shutdown, or until `max_polls` polls when set
///
/// `on_sample` sees every successful read (the CLI prints it). `every` is
/// raised to at least one millisecond.
pub async fn watch_count<F>(
    store: &dyn CountStore,
    filter: &RecordFilter,
    every: Duration,
    max_polls: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
    mut on_sample: F,
) -> WatchSummary
where
    F: FnMut(CountSample),
{
    let mut ticker = interval(every.max(MIN_WATCH_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = WatchSummary::default();

    loop {
        if max_polls.is_some_and(|max| summary.polls >= max) {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(polls = %summary.polls, "count_watch_shutdown");
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        summary.polls += 1;
        match store.count(filter).await {
            Ok(count) => {
                let delta = summary.last.map_or(0, |prev| count as i64 - prev as i64);
                summary.first.get_or_insert(count);
                summary.last = Some(count);
                info!(poll = %summary.polls, count = %count, delta = %delta, "row_count");
                on_sample(CountSample { poll: summary.polls, count, delta });
            }
            Err(e) => {
                summary.errors += 1;
                warn!(poll = %summary.polls, error = %e, "row_count_failed");
            }
        }
    }

    summary
}
