use crate::BatchSession;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 10;

/// Bounded, most-recent-first list of finished batches.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<BatchSession>,
    capacity: usize,
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl HistoryRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front; returns the evicted oldest entry, if any.
    pub fn record(&mut self, session: BatchSession) -> Option<BatchSession> {
        self.entries.push_front(session);
        if self.entries.len() > self.capacity {
            return self.entries.pop_back();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchSession> {
        self.entries.iter()
    }

    pub fn get(&self, id: &str) -> Option<&BatchSession> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn to_vec(&self) -> Vec<BatchSession> {
        self.entries.iter().cloned().collect()
    }
}

impl Serialize for HistoryRing {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn batch(id: usize) -> BatchSession {
        BatchSession::new(id.to_string(), format!("file-{id}.csv"), id, Utc::now())
    }

    #[test]
    fn keeps_newest_first() {
        let mut ring = HistoryRing::default();
        ring.record(batch(1));
        ring.record(batch(2));
        let ids: Vec<_> = ring.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn eleventh_insert_evicts_oldest() {
        let mut ring = HistoryRing::default();
        for id in 1..=10 {
            assert!(ring.record(batch(id)).is_none());
        }
        let evicted = ring.record(batch(11)).expect("evicts");
        assert_eq!(evicted.id, "1");
        assert_eq!(ring.len(), HISTORY_CAPACITY);
        assert_eq!(ring.iter().next().map(|entry| entry.id.as_str()), Some("11"));
        assert!(ring.get("1").is_none());
        assert!(ring.get("2").is_some());
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut ring = HistoryRing::with_capacity(3);
        for id in 0..50 {
            ring.record(batch(id));
            assert!(ring.len() <= 3);
        }
        let ids: Vec<_> = ring.to_vec().into_iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec!["49", "48", "47"]);
    }

    #[test]
    fn serializes_as_plain_list() {
        let mut ring = HistoryRing::default();
        ring.record(batch(4));
        let json = serde_json::to_value(&ring).expect("serialize");
        assert!(json.is_array());
        assert_eq!(json[0]["id"], "4");
    }
}
