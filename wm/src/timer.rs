//! One-shot timer service for the reactor
//!
//! `after(delay, event)` spawns a sleeper that posts `ReactorEvent::Timer` back to the
//! reactor; the reactor then calls `take()` so a cancelled timer that raced its own
//! expiry is simply ignored. Without a reactor sender (tests) timers are only recorded
//! and fired by hand.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffer::MonitorKind;
use crate::master::ReactorEvent;

/// Handle returned by [`Timers::after`]
pub type TimerId = u64;

/// What the reactor should do when a timer expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A queued command never got its reply
    ReplyTimeout { slave: String, seq: u64 },
    /// A worker stopped pinging
    PingTimeout { slave: String },
    /// An unreferenced worker outlived its grace period
    SlaveIdle { slave: String },
    /// A detail-view or resize monitor expired
    Monitor { pkg: String, id: String, kind: MonitorKind },
}

struct Armed {
    event: TimerEvent,
    deadline: Instant,
    task: Option<JoinHandle<()>>,
}

/// Cancellable one-shot timers keyed by id
pub struct Timers {
    tx: Option<mpsc::UnboundedSender<ReactorEvent>>,
    armed: HashMap<TimerId, Armed>,
    next_id: TimerId,
}

impl Timers {
    /// Timers that post expiries to the reactor
    pub fn new(tx: mpsc::UnboundedSender<ReactorEvent>) -> Self {
        Self {
            tx: Some(tx),
            armed: HashMap::new(),
            next_id: 1,
        }
    }

    /// Timers that never fire on their own
    pub fn manual() -> Self {
        Self {
            tx: None,
            armed: HashMap::new(),
            next_id: 1,
        }
    }

    /// Arm a one-shot timer
    pub fn after(&mut self, delay: Duration, event: TimerEvent) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, ?delay, ?event, "Timers::after: arming");

        let task = self.tx.as_ref().map(|tx| {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(ReactorEvent::Timer { id });
            })
        });

        self.armed.insert(
            id,
            Armed {
                event,
                deadline: Instant::now() + delay,
                task,
            },
        );
        id
    }

    /// Disarm a timer. Returns its event if it was still pending.
    pub fn cancel(&mut self, id: TimerId) -> Option<TimerEvent> {
        let armed = self.armed.remove(&id)?;
        debug!(id, event = ?armed.event, "Timers::cancel: disarming");
        if let Some(task) = armed.task {
            task.abort();
        }
        Some(armed.event)
    }

    /// Claim an expired timer. `None` if it was cancelled in the meantime.
    pub fn take(&mut self, id: TimerId) -> Option<TimerEvent> {
        self.armed.remove(&id).map(|armed| armed.event)
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Time left on a pending timer
    pub fn remaining(&self, id: TimerId) -> Option<Duration> {
        self.armed
            .get(&id)
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
    }

    /// First pending timer whose event matches
    pub fn find(&self, pred: impl Fn(&TimerEvent) -> bool) -> Option<TimerId> {
        let mut ids: Vec<_> = self.armed.iter().filter(|(_, a)| pred(&a.event)).map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.first().copied()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            if let Some(task) = armed.task {
                task.abort();
            }
        }
    }
}
