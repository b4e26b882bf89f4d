//! Deterministic timer wheel.
//!
//! The per-account loop owns one wheel and sleeps until
//! [`TimerWheel::next_deadline`]. Cancelled timers are removed eagerly and can
//! never be returned by [`TimerWheel::pop_due`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Ordered set of pending timers carrying an action of type `A`.
#[derive(Debug)]
pub struct TimerWheel<A> {
    next_id: u64,
    // (deadline, id) keeps insertion order for equal deadlines.
    queue: BTreeMap<(Instant, TimerId), A>,
    deadlines: HashMap<TimerId, Instant>,
}

impl<A> Default for TimerWheel<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> TimerWheel<A> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `action` to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, action: A) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = now + delay;
        self.queue.insert((deadline, id), action);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                trace!(timer = id.0, "timer cancelled");
                self.queue.remove(&(deadline, id)).is_some()
            },
            None => {
                debug!(timer = id.0, "cancelling a timer that is not scheduled");
                false
            },
        }
    }

    /// Move an existing timer to fire `delay` after `now`.
    pub fn reschedule(&mut self, id: TimerId, now: Instant, delay: Duration) -> Result<()> {
        let deadline = self
            .deadlines
            .get(&id)
            .copied()
            .ok_or(Error::UnknownTimer(id.0))
            .inspect_err(|_| debug!(timer = id.0, "rescheduling an unknown timer"))?;
        let Some(action) = self.queue.remove(&(deadline, id)) else {
            return Err(Error::UnknownTimer(id.0));
        };
        let new_deadline = now + delay;
        self.queue.insert((new_deadline, id), action);
        self.deadlines.insert(id, new_deadline);
        Ok(())
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer whose deadline is `<= now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, A)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), action) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, action));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}
