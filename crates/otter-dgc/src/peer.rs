//! Bookkeeping for one inbound referencer.

use crate::activity::Activity;

/// What a collector remembers about an object that references it.
///
/// Created on the first message from an unknown sender, dropped once the
/// sender has been silent for longer than the alone timeout.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    given_activity: Option<Activity>,
    consensus_agreed: bool,
    last_seen_at_ms: i64,
    notified_of_cycle: bool,
}

impl PeerRecord {
    /// Record for a sender first heard from at `now_ms`
    pub fn new(now_ms: i64) -> Self {
        Self {
            given_activity: None,
            consensus_agreed: false,
            last_seen_at_ms: now_ms,
            notified_of_cycle: false,
        }
    }

    /// Account for a message carrying `consensus`, answered with `given`.
    ///
    /// A referencer can only agree on the exact activity it was told about,
    /// so a change of the given activity discards its agreement.
    pub fn record(&mut self, consensus: bool, given: Activity, now_ms: i64) {
        self.last_seen_at_ms = now_ms;
        if self.given_activity == Some(given) {
            self.consensus_agreed = consensus;
        } else {
            self.consensus_agreed = false;
            self.given_activity = Some(given);
        }
    }

    /// Whether this referencer agrees on `activity`
    pub fn agrees_on(&self, activity: &Activity) -> bool {
        self.consensus_agreed && self.given_activity.as_ref() == Some(activity)
    }

    /// Whether the record has expired at `now_ms`
    pub fn is_stale(&self, now_ms: i64, tta_ms: i64) -> bool {
        now_ms - self.last_seen_at_ms > tta_ms
    }

    /// Last activity handed to this referencer
    pub fn given_activity(&self) -> Option<Activity> {
        self.given_activity
    }

    /// Time of the last message
    pub fn last_seen_at_ms(&self) -> i64 {
        self.last_seen_at_ms
    }

    /// Whether the referencer was told about a cycle
    pub fn notified_of_cycle(&self) -> bool {
        self.notified_of_cycle
    }

    /// Mark the referencer as told about a cycle
    pub fn set_notified_of_cycle(&mut self) {
        self.notified_of_cycle = true;
    }
}
