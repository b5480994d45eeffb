use crate::watermark::WatermarkTracker;
use crate::windows::{window_assigner, TimeWindowAssigner};
use brook_metrics::{LateOutcome, PartitionMetrics};
use brook_rpc::config::{ConfigError, EmitMode, FilterConfig, LatePolicy, WindowConfig};
use brook_rpc::PartitionSnapshot;
use brook_state::{OffsetCursor, StateBudget, StateError, WindowStateStore};
use brook_types::{
    print_time, ActivityRecord, EmittedAggregate, EventType, Offset, PartitionId, WindowKey,
};
use std::collections::HashSet;
use tracing::{debug, info};

/// Decides which records take part in aggregation.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    event_types: HashSet<EventType>,
}

impl EventFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            event_types: config.event_types.iter().cloned().collect(),
        }
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, record: &ActivityRecord) -> bool {
        self.event_types.is_empty() || self.event_types.contains(record.event_type())
    }
}

/// The ingestion path for a single feed partition: filtering, late-data handling, window
/// assignment, accumulation, watermark advancement and emission of closed windows.
pub struct Pipeline {
    partition: PartitionId,
    filter: EventFilter,
    assigner: Box<dyn TimeWindowAssigner>,
    late_policy: LatePolicy,
    emit_mode: EmitMode,
    watermarks: WatermarkTracker,
    state: WindowStateStore,
    cursor: OffsetCursor,
    metrics: PartitionMetrics,
}

impl Pipeline {
    pub fn new(
        partition: PartitionId,
        window: &WindowConfig,
        filter: &FilterConfig,
        budget: StateBudget,
    ) -> Result<Self, ConfigError> {
        let assigner = window_assigner(window)?;

        Ok(Self {
            partition,
            filter: EventFilter::new(filter),
            assigner,
            late_policy: window.late_policy,
            emit_mode: window.emit_mode,
            watermarks: WatermarkTracker::new(*window.allowed_lateness),
            state: WindowStateStore::with_budget(budget),
            cursor: OffsetCursor::new(partition),
            metrics: PartitionMetrics::new(partition),
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// The feed offset to continue reading from.
    pub fn next_offset(&self) -> Offset {
        self.cursor.next_offset()
    }

    pub fn cursor(&self) -> &OffsetCursor {
        &self.cursor
    }

    pub fn state_size(&self) -> usize {
        self.state.len()
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    pub fn state(&self) -> &WindowStateStore {
        &self.state
    }

    /// Decodes a raw feed payload and ingests it. Payloads that fail to decode are counted and
    /// skipped; they advance the offset cursor but never the watermark.
    pub fn ingest_payload(
        &mut self,
        payload: &[u8],
        offset: Offset,
    ) -> Result<Vec<EmittedAggregate>, StateError> {
        if self.skip_duplicate(offset) {
            return Ok(vec![]);
        }

        match ActivityRecord::from_json(payload) {
            Ok(record) => self.ingest(&record, offset),
            Err(e) => {
                debug!(
                    message = "dropping malformed record",
                    partition = self.partition,
                    offset,
                    error = %e
                );
                self.metrics.malformed.inc();
                self.cursor.advance(offset);
                Ok(vec![])
            }
        }
    }

    /// Applies a single record, returning the aggregates it caused to be emitted. An error means
    /// the window state bound was hit; the record's offset is not marked as processed.
    pub fn ingest(
        &mut self,
        record: &ActivityRecord,
        offset: Offset,
    ) -> Result<Vec<EmittedAggregate>, StateError> {
        if self.skip_duplicate(offset) {
            return Ok(vec![]);
        }

        if !self.filter.accepts(record) {
            self.metrics.filtered.inc();
            self.cursor.advance(offset);
            return Ok(vec![]);
        }

        let emitted = if self.watermarks.is_late(record.user_id(), record.event_timestamp()) {
            self.ingest_late(record)?
        } else {
            self.ingest_on_time(record)?
        };

        self.cursor.advance(offset);
        self.metrics.state_size.set(self.state.len() as i64);
        for agg in &emitted {
            self.metrics.emitted(agg.is_final);
        }

        Ok(emitted)
    }

    fn skip_duplicate(&self, offset: Offset) -> bool {
        if self.cursor.is_processed(offset) {
            self.metrics.duplicate.inc();
            true
        } else {
            false
        }
    }

    fn ingest_on_time(
        &mut self,
        record: &ActivityRecord,
    ) -> Result<Vec<EmittedAggregate>, StateError> {
        let group = record.user_id();
        let mut emitted = vec![];

        for window in self.assigner.windows(record.event_timestamp()) {
            let key = WindowKey::new(group, window);
            let acc = self.state.upsert(&key, record)?;
            if self.emit_mode == EmitMode::OnUpdate {
                emitted.push(EmittedAggregate::from_state(&key, acc, false));
            }
        }
        self.metrics.ingested.inc();

        if let Some(watermark) = self.watermarks.observe(group, record.event_timestamp()) {
            emitted.extend(
                self.state
                    .evict_closed(group, watermark)
                    .iter()
                    .map(|(key, acc)| EmittedAggregate::from_state(key, acc, true)),
            );
        }

        Ok(emitted)
    }

    fn ingest_late(
        &mut self,
        record: &ActivityRecord,
    ) -> Result<Vec<EmittedAggregate>, StateError> {
        let group = record.user_id();

        if self.late_policy == LatePolicy::Drop {
            self.late_dropped(record);
            return Ok(vec![]);
        }

        let Some(watermark) = self.watermarks.get(group) else {
            return Ok(vec![]);
        };

        // windows ending at or before the watermark have been closed and are never reopened
        let mut emitted = vec![];
        for window in self.assigner.windows(record.event_timestamp()) {
            if window.end_time <= watermark {
                continue;
            }
            let key = WindowKey::new(group, window);
            let acc = self.state.upsert(&key, record)?;
            emitted.push(EmittedAggregate::from_state(&key, acc, false));
        }

        if emitted.is_empty() {
            self.late_dropped(record);
        } else {
            self.metrics.late(LateOutcome::Corrected);
        }

        Ok(emitted)
    }

    fn late_dropped(&self, record: &ActivityRecord) {
        debug!(
            message = "dropping late record",
            partition = self.partition,
            user_id = record.user_id(),
            event_time = print_time(record.event_timestamp()),
        );
        self.metrics.late(LateOutcome::Dropped);
    }

    /// Closes every open window at the end of a bounded feed. Each key's watermark is moved to
    /// the end of its last window so that the closed windows cannot be reopened.
    pub fn finish(&mut self) -> Vec<EmittedAggregate> {
        let evicted = self.state.evict_all();
        info!(
            message = "closing all windows at end of data",
            partition = self.partition,
            windows = evicted.len()
        );

        let emitted: Vec<_> = evicted
            .iter()
            .map(|(key, acc)| {
                self.watermarks.advance_to(&key.key, key.window_end());
                EmittedAggregate::from_state(key, acc, true)
            })
            .collect();

        self.metrics.state_size.set(0);
        for _ in &emitted {
            self.metrics.emitted(true);
        }
        emitted
    }

    /// Copies the state of the pipeline as of the last processed offset.
    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            offset: self.cursor.last(),
            accumulators: self.state.snapshot(),
            watermarks: self.watermarks.snapshot(),
        }
    }

    pub fn restore(&mut self, snapshot: &PartitionSnapshot) -> Result<(), StateError> {
        self.state.restore(snapshot.accumulators.iter().cloned())?;
        self.watermarks.restore(snapshot.watermarks.iter().cloned());
        self.cursor = OffsetCursor::restored(self.partition, snapshot.offset);
        self.metrics.state_size.set(self.state.len() as i64);

        info!(
            message = "restored partition state",
            partition = self.partition,
            offset = ?snapshot.offset,
            windows = self.state.len(),
            keys = self.watermarks.len()
        );
        Ok(())
    }
}
