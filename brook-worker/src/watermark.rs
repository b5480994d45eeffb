use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Event-time progress per grouping key. A key with no watermark has seen no on-time record
/// yet; once set, a watermark only moves forward.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    allowed_lateness: Duration,
    watermarks: HashMap<String, SystemTime>,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness,
            watermarks: HashMap::new(),
        }
    }

    pub fn allowed_lateness(&self) -> Duration {
        self.allowed_lateness
    }

    pub fn get(&self, key: &str) -> Option<SystemTime> {
        self.watermarks.get(key).copied()
    }

    /// A record is late when its event time is strictly below the key's watermark; a record
    /// exactly at the watermark is on time.
    pub fn is_late(&self, key: &str, ts: SystemTime) -> bool {
        self.get(key).is_some_and(|watermark| ts < watermark)
    }

    /// Accounts for an on-time record, returning the new watermark if it moved.
    pub fn observe(&mut self, key: &str, ts: SystemTime) -> Option<SystemTime> {
        let candidate = ts
            .checked_sub(self.allowed_lateness)
            .filter(|t| *t >= UNIX_EPOCH)?;

        self.advance_to(key, candidate)
    }

    /// Moves the watermark of `key` to `watermark` unless it is already at or past it.
    pub fn advance_to(&mut self, key: &str, watermark: SystemTime) -> Option<SystemTime> {
        match self.watermarks.get_mut(key) {
            Some(current) if *current >= watermark => None,
            Some(current) => {
                *current = watermark;
                Some(watermark)
            }
            None => {
                self.watermarks.insert(key.to_string(), watermark);
                Some(watermark)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(String, SystemTime)> {
        let mut entries: Vec<_> = self
            .watermarks
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }

    pub fn restore(&mut self, entries: impl IntoIterator<Item = (String, SystemTime)>) {
        self.watermarks = entries.into_iter().collect();
    }
}
