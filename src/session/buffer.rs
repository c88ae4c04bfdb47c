//! In-memory bounded conversation buffers, one FIFO per session.
//!
//! The buffer holds the most recent N turns for fast context assembly.
//! Overflow is returned to the caller as an oldest-first eviction batch; the
//! caller is responsible for archiving it.

use super::key::SessionKey;
use super::Turn;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub struct SessionBuffer {
    capacity: usize,
    buffers: Mutex<HashMap<SessionKey, VecDeque<Turn>>>,
}

impl SessionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a turn. Returns the turns evicted to stay within capacity,
    /// oldest first (usually zero or one).
    pub fn append(&self, key: &SessionKey, turn: Turn) -> Vec<Turn> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.entry(key.clone()).or_default();
        buffer.push_back(turn);

        let mut evicted = Vec::new();
        while buffer.len() > self.capacity {
            if let Some(oldest) = buffer.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    pub fn get_turns(&self, key: &SessionKey) -> Vec<Turn> {
        self.buffers
            .lock()
            .unwrap()
            .get(key)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, key: &SessionKey) -> bool {
        self.buffers
            .lock()
            .unwrap()
            .get(key)
            .is_none_or(|buffer| buffer.is_empty())
    }

    /// Replace a session's buffer with `turns`, clamped to the last N.
    pub fn restore(&self, key: &SessionKey, turns: Vec<Turn>) {
        let skip = turns.len().saturating_sub(self.capacity);
        let clamped: VecDeque<Turn> = turns.into_iter().skip(skip).collect();
        self.buffers.lock().unwrap().insert(key.clone(), clamped);
    }

    /// Remove and return a session's buffered turns, oldest first.
    pub fn flush(&self, key: &SessionKey) -> Vec<Turn> {
        self.buffers
            .lock()
            .unwrap()
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drain every session. Used at shutdown to push all buffered turns into
    /// the archive.
    pub fn flush_all(&self) -> HashMap<SessionKey, Vec<Turn>> {
        self.buffers
            .lock()
            .unwrap()
            .drain()
            .map(|(key, buffer)| (key, Vec::from(buffer)))
            .collect()
    }
}
