use crate::config::ReconnectConfig;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::{debug, info};

/// seconds to wait before reconnect attempt number `attempts` (counting from 0)
pub fn backoff_delay(factor: f64, ceiling: u64, attempts: u32) -> u64 {
    if attempts == 0 {
        return 0;
    }

    let delay = factor.powi(attempts as i32 + 2).ceil();
    if !delay.is_finite() || delay < 0.0 || delay > ceiling as f64 {
        ceiling
    } else {
        delay as u64
    }
}

/// seconds left on the job lease, zero once it expired
pub fn remaining_lease(lease_duration: i64, last_renewal: i64, now: i64) -> u64 {
    (lease_duration - (now - last_renewal)).max(0) as u64
}

/// the payload was running when contact was lost
pub fn began_execution(executing_since: Option<i64>, claimed_since: Option<i64>) -> bool {
    match executing_since {
        Some(executing_since) => executing_since >= claimed_since.unwrap_or(0),
        None => false,
    }
}

/// Result of the last peer leaving RECONNECTING
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectCompletion {
    /// these reconnects were started by a coordinator restart
    pub at_startup: bool,
    /// removal to replay now, signal included
    pub deferred_removal: Option<i32>,
}

/// Tracks the peers being reconnected and what waits on them
#[derive(Debug, Default)]
pub struct ReconnectCoordinator {
    config: ReconnectConfig,
    pending: BTreeSet<usize>,
    attempts: BTreeMap<usize, u32>,
    deferred_removal: Option<i32>,
    at_startup: bool,
}

impl ReconnectCoordinator {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn begin<I: IntoIterator<Item = usize>>(&mut self, nodes: I, at_startup: bool) {
        self.at_startup |= at_startup;

        for node in nodes {
            debug!(node = node, "Waiting on reconnect");
            self.pending.insert(node);
            self.attempts.insert(node, 0);
        }
    }

    pub fn in_flight(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_pending(&self, node: usize) -> bool {
        self.pending.contains(&node)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_removal(&self) -> Option<i32> {
        self.deferred_removal
    }

    /// hold back a removal until every peer reconnected, the first one is kept
    pub fn defer_removal(&mut self, signal: i32) {
        match self.deferred_removal {
            Some(earlier) => debug!("Removal already deferred (signal {earlier})"),
            None => {
                info!(
                    "Deferring removal until {} node(s) reconnected",
                    self.pending.len()
                );
                self.deferred_removal = Some(signal);
            }
        }
    }

    pub fn record_attempt(&mut self, node: usize) -> u32 {
        let attempts = self.attempts.entry(node).or_insert(0);
        *attempts += 1;

        *attempts
    }

    /// delay before the next attempt for `node`, never beyond the remaining lease
    pub fn next_delay(&self, node: usize, remaining_lease: u64) -> Duration {
        let attempts = self.attempts.get(&node).copied().unwrap_or(0);
        let delay = backoff_delay(
            self.config.backoff_factor,
            self.config.backoff_ceiling,
            attempts,
        );

        Duration::from_secs(delay.min(remaining_lease))
    }

    /// `node` left RECONNECTING, returns what to do once it was the last one
    pub fn peer_done(&mut self, node: usize) -> Option<ReconnectCompletion> {
        if !self.pending.remove(&node) {
            return None;
        }
        self.attempts.remove(&node);

        if self.pending.is_empty() {
            let completion = ReconnectCompletion {
                at_startup: self.at_startup,
                deferred_removal: self.deferred_removal.take(),
            };
            self.at_startup = false;

            Some(completion)
        } else {
            debug!("{} node(s) still reconnecting", self.pending.len());
            None
        }
    }
}
