use crate::StateError;
use brook_types::{ActivityRecord, Window, WindowAccumulator, WindowKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// A bound on the number of live accumulators, shared by every shard of window state in an
/// engine instance.
#[derive(Debug, Clone)]
pub struct StateBudget {
    limit: usize,
    used: Arc<AtomicUsize>,
}

impl StateBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn reserve(&self, n: usize) -> Result<(), StateError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|_| StateError::CapacityExceeded { limit: self.limit })
    }

    fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
    }
}

// windows for a single grouping key, ordered by (end, start) so that closed windows form a prefix
type KeyWindows = BTreeMap<(SystemTime, SystemTime), WindowAccumulator>;

/// Holds the partial aggregate for every open (key, window) pair of one shard.
#[derive(Debug)]
pub struct WindowStateStore {
    budget: StateBudget,
    windows: HashMap<String, KeyWindows>,
    len: usize,
}

impl WindowStateStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_budget(StateBudget::new(capacity))
    }

    pub fn with_budget(budget: StateBudget) -> Self {
        Self {
            budget,
            windows: HashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn budget(&self) -> &StateBudget {
        &self.budget
    }

    pub fn get(&self, key: &WindowKey) -> Option<&WindowAccumulator> {
        self.windows
            .get(&key.key)?
            .get(&(key.window_end(), key.window_start()))
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.get(key).is_some()
    }

    /// Merges `record` into the accumulator for `key`, creating it if this is the first record
    /// for the window.
    pub fn upsert(
        &mut self,
        key: &WindowKey,
        record: &ActivityRecord,
    ) -> Result<&WindowAccumulator, StateError> {
        let slot = (key.window_end(), key.window_start());
        let exists = self
            .windows
            .get(&key.key)
            .is_some_and(|w| w.contains_key(&slot));

        if !exists {
            self.budget.reserve(1)?;
            self.len += 1;
        }

        let acc = self
            .windows
            .entry(key.key.clone())
            .or_default()
            .entry(slot)
            .or_default();
        acc.add(record.value());
        Ok(acc)
    }

    pub fn evict(&mut self, key: &WindowKey) -> Option<WindowAccumulator> {
        let windows = self.windows.get_mut(&key.key)?;
        let removed = windows.remove(&(key.window_end(), key.window_start()));
        if windows.is_empty() {
            self.windows.remove(&key.key);
        }
        if removed.is_some() {
            self.removed(1);
        }
        removed
    }

    /// Removes and returns every window of `group` whose end is at or before `watermark`, in
    /// order of window end.
    pub fn evict_closed(
        &mut self,
        group: &str,
        watermark: SystemTime,
    ) -> Vec<(WindowKey, WindowAccumulator)> {
        let Some(windows) = self.windows.get_mut(group) else {
            return vec![];
        };

        let closed: Vec<_> = windows
            .keys()
            .take_while(|(end, _)| *end <= watermark)
            .copied()
            .collect();

        let evicted: Vec<_> = closed
            .into_iter()
            .filter_map(|slot| {
                let acc = windows.remove(&slot)?;
                Some((WindowKey::new(group, Window::new(slot.1, slot.0)), acc))
            })
            .collect();

        if windows.is_empty() {
            self.windows.remove(group);
        }
        self.removed(evicted.len());
        evicted
    }

    /// Removes every window, ordered by window end and then key.
    pub fn evict_all(&mut self) -> Vec<(WindowKey, WindowAccumulator)> {
        let mut evicted: Vec<_> = self
            .windows
            .drain()
            .flat_map(|(group, windows)| {
                windows.into_iter().map(move |((end, start), acc)| {
                    (WindowKey::new(group.clone(), Window::new(start, end)), acc)
                })
            })
            .collect();
        evicted.sort_by(|(a, _), (b, _)| {
            (a.window_end(), &a.key, a.window_start()).cmp(&(
                b.window_end(),
                &b.key,
                b.window_start(),
            ))
        });

        self.removed(evicted.len());
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = (WindowKey, &WindowAccumulator)> + '_ {
        self.windows.iter().flat_map(|(group, windows)| {
            windows.iter().map(move |((end, start), acc)| {
                (WindowKey::new(group.as_str(), Window::new(*start, *end)), acc)
            })
        })
    }

    /// An owned copy of the current state, sorted by key.
    pub fn snapshot(&self) -> Vec<(WindowKey, WindowAccumulator)> {
        let mut entries: Vec<_> = self.iter().map(|(k, v)| (k, v.clone())).collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    /// Replaces the contents of the store with previously snapshotted state.
    pub fn restore(
        &mut self,
        entries: impl IntoIterator<Item = (WindowKey, WindowAccumulator)>,
    ) -> Result<(), StateError> {
        self.clear();

        for (key, acc) in entries {
            self.budget.reserve(1)?;
            self.len += 1;
            let previous = self
                .windows
                .entry(key.key.clone())
                .or_default()
                .insert((key.window_end(), key.window_start()), acc);

            if previous.is_some() {
                self.removed(1);
                return Err(StateError::DuplicateWindow(format!(
                    "{} {}",
                    key.key, key.window
                )));
            }
        }

        Ok(())
    }

    fn clear(&mut self) {
        let len = self.len;
        self.windows.clear();
        self.removed(len);
    }

    fn removed(&mut self, n: usize) {
        self.len -= n;
        self.budget.release(n);
    }
}

impl Drop for WindowStateStore {
    fn drop(&mut self) {
        self.budget.release(self.len);
    }
}
