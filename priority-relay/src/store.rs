//! Backlog of envelopes that have not been retired yet.
//!
//! New clients receive a replay of this backlog right after they join. The
//! state sits behind a single async mutex; the broadcaster keeps the guard for
//! a whole delivery so stamping, fan-out and the store update happen as one
//! step with respect to joins and other broadcasts.

use chrono::{NaiveTime, TimeDelta, Timelike};
use tokio::sync::{Mutex, MutexGuard};

use crate::protocol::{Envelope, TIMESTAMP_FORMAT};

/// The guarded contents of an [`ActiveMessageStore`].
#[derive(Debug, Default)]
pub struct ActiveMessages {
    entries: Vec<Envelope>,
    last_stamp: Option<NaiveTime>,
}

impl ActiveMessages {
    /// Appends an envelope. Returns `false`, leaving the store untouched, when
    /// an envelope with the same sender and timestamp is already active.
    pub fn append(&mut self, envelope: Envelope) -> bool {
        let duplicate = self.entries.iter().any(|entry| {
            entry.sender() == envelope.sender() && entry.timestamp() == envelope.timestamp()
        });
        if !duplicate {
            self.entries.push(envelope);
        }
        !duplicate
    }

    /// Removes every entry stamped with `timestamp`, returning how many went.
    pub fn remove(&mut self, timestamp: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp() != timestamp);
        before - self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<Envelope> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Issues the timestamp for the next envelope.
    ///
    /// Stamps handed out by one store never repeat: if the clock has not moved
    /// past the previous stamp (same microsecond, or a small step backwards),
    /// the previous stamp plus one microsecond is used instead.
    pub fn stamp(&mut self, now: NaiveTime) -> String {
        let now = now - TimeDelta::nanoseconds(i64::from(now.nanosecond() % 1_000));
        let stamp = match self.last_stamp {
            Some(last) if now <= last && last - now < TimeDelta::seconds(1) => {
                last + TimeDelta::microseconds(1)
            }
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Shared, lock-guarded [`ActiveMessages`].
#[derive(Debug, Default)]
pub struct ActiveMessageStore {
    state: Mutex<ActiveMessages>,
}

impl ActiveMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the store for a multi-step operation.
    pub async fn lock(&self) -> MutexGuard<'_, ActiveMessages> {
        self.state.lock().await
    }

    pub async fn append(&self, envelope: Envelope) -> bool {
        self.state.lock().await.append(envelope)
    }

    pub async fn remove(&self, timestamp: &str) -> usize {
        self.state.lock().await.remove(timestamp)
    }

    pub async fn snapshot(&self) -> Vec<Envelope> {
        self.state.lock().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}
