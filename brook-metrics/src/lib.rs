use brook_types::PartitionId;
use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

pub const RECORDS_INGESTED: &str = "brook_records_ingested";
pub const RECORDS_FILTERED: &str = "brook_records_filtered";
pub const RECORDS_MALFORMED: &str = "brook_records_malformed";
pub const RECORDS_DUPLICATE: &str = "brook_records_duplicate";
pub const RECORDS_LATE: &str = "brook_records_late";
pub const WINDOW_STATE_SIZE: &str = "brook_window_state_size";
pub const AGGREGATES_EMITTED: &str = "brook_aggregates_emitted";
pub const SINK_RETRIES: &str = "brook_sink_retries";
pub const SINK_DEGRADED: &str = "brook_sink_degraded";
pub const CHECKPOINTS_COMPLETED: &str = "brook_checkpoints_completed";
pub const CHECKPOINT_DURATION: &str = "brook_checkpoint_duration_seconds";

lazy_static! {
    static ref PARTITION_LABELS: Vec<&'static str> = vec!["partition"];
    pub static ref RECORDS_INGESTED_COUNTER: IntCounterVec = register_int_counter_vec!(
        RECORDS_INGESTED,
        "Count of records accepted into window state",
        &PARTITION_LABELS
    )
    .unwrap();
    pub static ref RECORDS_FILTERED_COUNTER: IntCounterVec = register_int_counter_vec!(
        RECORDS_FILTERED,
        "Count of records rejected by the event type filter",
        &PARTITION_LABELS
    )
    .unwrap();
    pub static ref RECORDS_MALFORMED_COUNTER: IntCounterVec = register_int_counter_vec!(
        RECORDS_MALFORMED,
        "Count of feed payloads that could not be decoded",
        &PARTITION_LABELS
    )
    .unwrap();
    pub static ref RECORDS_DUPLICATE_COUNTER: IntCounterVec = register_int_counter_vec!(
        RECORDS_DUPLICATE,
        "Count of redelivered records skipped because their offset was already processed",
        &PARTITION_LABELS
    )
    .unwrap();
    pub static ref RECORDS_LATE_COUNTER: IntCounterVec = register_int_counter_vec!(
        RECORDS_LATE,
        "Count of records that arrived behind the watermark, by outcome",
        &["partition", "outcome"]
    )
    .unwrap();
    pub static ref WINDOW_STATE_SIZE_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        WINDOW_STATE_SIZE,
        "Number of live window accumulators",
        &PARTITION_LABELS
    )
    .unwrap();
    pub static ref AGGREGATES_EMITTED_COUNTER: IntCounterVec = register_int_counter_vec!(
        AGGREGATES_EMITTED,
        "Count of aggregates emitted, by kind",
        &["partition", "kind"]
    )
    .unwrap();
    pub static ref SINK_RETRIES_COUNTER: IntCounter =
        register_int_counter!(SINK_RETRIES, "Count of retried aggregate store writes").unwrap();
    pub static ref SINK_DEGRADED_GAUGE: IntGauge = register_int_gauge!(
        SINK_DEGRADED,
        "1 while aggregate store writes are failing and being retried"
    )
    .unwrap();
    pub static ref CHECKPOINTS_COMPLETED_COUNTER: IntCounter = register_int_counter!(
        CHECKPOINTS_COMPLETED,
        "Count of checkpoints durably written"
    )
    .unwrap();
    pub static ref CHECKPOINT_DURATION_HISTOGRAM: Histogram = register_histogram!(
        CHECKPOINT_DURATION,
        "Time from barrier injection to the checkpoint being durable",
        exponential_buckets(0.001, 2.0, 16).unwrap()
    )
    .unwrap();
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LateOutcome {
    Dropped,
    Corrected,
}

impl LateOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LateOutcome::Dropped => "dropped",
            LateOutcome::Corrected => "corrected",
        }
    }
}

/// Metric handles bound to the label values of a single partition's subtask.
#[derive(Clone)]
pub struct PartitionMetrics {
    pub ingested: IntCounter,
    pub filtered: IntCounter,
    pub malformed: IntCounter,
    pub duplicate: IntCounter,
    pub late_dropped: IntCounter,
    pub late_corrected: IntCounter,
    pub emitted_final: IntCounter,
    pub emitted_update: IntCounter,
    pub state_size: IntGauge,
}

impl PartitionMetrics {
    pub fn new(partition: PartitionId) -> Self {
        let p = partition.to_string();
        let p = p.as_str();
        let late =
            |outcome: LateOutcome| RECORDS_LATE_COUNTER.with_label_values(&[p, outcome.as_str()]);

        Self {
            ingested: RECORDS_INGESTED_COUNTER.with_label_values(&[p]),
            filtered: RECORDS_FILTERED_COUNTER.with_label_values(&[p]),
            malformed: RECORDS_MALFORMED_COUNTER.with_label_values(&[p]),
            duplicate: RECORDS_DUPLICATE_COUNTER.with_label_values(&[p]),
            late_dropped: late(LateOutcome::Dropped),
            late_corrected: late(LateOutcome::Corrected),
            emitted_final: AGGREGATES_EMITTED_COUNTER.with_label_values(&[p, "final"]),
            emitted_update: AGGREGATES_EMITTED_COUNTER.with_label_values(&[p, "update"]),
            state_size: WINDOW_STATE_SIZE_GAUGE.with_label_values(&[p]),
        }
    }

    pub fn late(&self, outcome: LateOutcome) {
        match outcome {
            LateOutcome::Dropped => self.late_dropped.inc(),
            LateOutcome::Corrected => self.late_corrected.inc(),
        }
    }

    pub fn emitted(&self, is_final: bool) {
        if is_final {
            self.emitted_final.inc();
        } else {
            self.emitted_update.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_metrics_are_labelled() {
        let metrics = PartitionMetrics::new(4242);
        metrics.late(LateOutcome::Corrected);
        metrics.late(LateOutcome::Corrected);
        metrics.emitted(true);

        assert_eq!(
            RECORDS_LATE_COUNTER
                .with_label_values(&["4242", "corrected"])
                .get(),
            2
        );
        assert_eq!(
            RECORDS_LATE_COUNTER
                .with_label_values(&["4242", "dropped"])
                .get(),
            0
        );
        assert_eq!(
            AGGREGATES_EMITTED_COUNTER
                .with_label_values(&["4242", "final"])
                .get(),
            1
        );
    }
}
