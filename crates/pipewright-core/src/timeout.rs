//! Timeout trackers - deadlines tracked independently of execution threads.
//!
//! A tracker never mutates node state. The engine's timeout monitor polls
//! trackers and raises a MarkExpired interrupt when one expires, keeping the
//! interrupt subsystem the single entry point for state mutation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::node::NodeExecutionId;

/// Observable state of a tracker at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Ticking,
    Paused,
    Expired,
}

/// Deadline-tracking contract.
pub trait TimeoutTracker {
    /// Wall-clock expiry, `None` while indefinitely paused.
    fn expiry_time(&self) -> Option<DateTime<Utc>>;

    /// State as observed at `now`.
    fn state_at(&self, now: DateTime<Utc>) -> TrackerState;
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Fixed wall-clock deadline measured from start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsoluteTracker {
    start: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl AbsoluteTracker {
    pub fn new(start: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            start,
            deadline: start + to_chrono(timeout),
        }
    }

    pub fn starting_now(timeout: Duration) -> Self {
        Self::new(Utc::now(), timeout)
    }
}

impl TimeoutTracker for AbsoluteTracker {
    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        Some(self.deadline)
    }

    fn state_at(&self, now: DateTime<Utc>) -> TrackerState {
        if now >= self.deadline {
            TrackerState::Expired
        } else {
            TrackerState::Ticking
        }
    }
}

/// Pausable deadline: the budget accrues only while ticking.
///
/// While paused the expiry is indefinite; resuming shifts the deadline to
/// `resume + (timeout - already_elapsed)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTracker {
    timeout: Duration,
    /// Budget consumed across completed ticking stretches.
    accrued: Duration,
    /// Start of the current ticking stretch, `None` while paused.
    ticking_since: Option<DateTime<Utc>>,
}

impl ActiveTracker {
    pub fn new(start: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            timeout,
            accrued: Duration::ZERO,
            ticking_since: Some(start),
        }
    }

    pub fn starting_now(timeout: Duration) -> Self {
        Self::new(Utc::now(), timeout)
    }

    /// Stop the budget clock. No-op while already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.ticking_since.take() {
            let stretch = (now - since).to_std().unwrap_or(Duration::ZERO);
            self.accrued = self.accrued.saturating_add(stretch);
        }
    }

    /// Restart the budget clock. No-op while already ticking.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        if self.ticking_since.is_none() {
            self.ticking_since = Some(now);
        }
    }

    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.accrued)
    }
}

impl TimeoutTracker for ActiveTracker {
    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.ticking_since
            .map(|since| since + to_chrono(self.remaining()))
    }

    fn state_at(&self, now: DateTime<Utc>) -> TrackerState {
        match self.expiry_time() {
            None => {
                if self.remaining() == Duration::ZERO {
                    TrackerState::Expired
                } else {
                    TrackerState::Paused
                }
            }
            Some(expiry) if now >= expiry => TrackerState::Expired,
            Some(_) => TrackerState::Ticking,
        }
    }
}

/// Tracker variants, storable as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tracker {
    Absolute(AbsoluteTracker),
    Active(ActiveTracker),
}

impl Tracker {
    /// Pause, where the variant supports it. Returns whether anything
    /// changed.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        match self {
            Tracker::Absolute(_) => false,
            Tracker::Active(t) => {
                let was_ticking = t.ticking_since.is_some();
                t.pause(now);
                was_ticking
            }
        }
    }

    /// Resume, where the variant supports it. Returns whether anything
    /// changed.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        match self {
            Tracker::Absolute(_) => false,
            Tracker::Active(t) => {
                let was_paused = t.ticking_since.is_none();
                t.resume(now);
                was_paused
            }
        }
    }
}

impl TimeoutTracker for Tracker {
    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Tracker::Absolute(t) => t.expiry_time(),
            Tracker::Active(t) => t.expiry_time(),
        }
    }

    fn state_at(&self, now: DateTime<Utc>) -> TrackerState {
        match self {
            Tracker::Absolute(t) => t.state_at(now),
            Tracker::Active(t) => t.state_at(now),
        }
    }
}

/// One active deadline, owned by the node execution that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutInstance {
    pub id: String,
    pub node_execution_id: NodeExecutionId,
    pub tracker: Tracker,
}

impl TimeoutInstance {
    pub fn new(node_execution_id: impl Into<NodeExecutionId>, tracker: Tracker) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_execution_id: node_execution_id.into(),
            tracker,
        }
    }
}
