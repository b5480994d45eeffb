pub mod config;

use bincode::{Decode, Encode};
use brook_types::{CheckpointBarrier, Offset, PartitionId, WindowAccumulator, WindowKey};
use std::collections::BTreeMap;
use std::time::SystemTime;

pub use rand;

#[derive(Debug, Clone)]
pub enum ControlMessage {
    Checkpoint(CheckpointBarrier),
    Stop,
}

/// The state of a single partition's subtask at a checkpoint barrier.
#[derive(Debug, Clone, PartialEq, Default, Encode, Decode)]
pub struct PartitionSnapshot {
    /// Highest offset whose effects are reflected in the accumulators and watermarks below.
    pub offset: Option<Offset>,
    pub accumulators: Vec<(WindowKey, WindowAccumulator)>,
    pub watermarks: Vec<(String, SystemTime)>,
}

#[derive(Debug, Clone)]
pub struct SubtaskCheckpoint {
    pub partition: PartitionId,
    pub epoch: u32,
    pub start_time: SystemTime,
    pub finish_time: SystemTime,
    pub snapshot: PartitionSnapshot,
}

#[derive(Debug, Clone)]
pub enum ControlResp {
    CheckpointCompleted(SubtaskCheckpoint),
    CheckpointRequested {
        partition: PartitionId,
    },
    EndOfData {
        partition: PartitionId,
    },
    TaskFinished {
        partition: PartitionId,
    },
    TaskFailed {
        partition: PartitionId,
        error: String,
    },
}

/// A durable snapshot of engine progress: feed offsets, window state and watermarks, all as of
/// the same barrier.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Checkpoint {
    pub checkpoint_id: u64,
    pub created_at: SystemTime,
    pub partitions: BTreeMap<PartitionId, PartitionSnapshot>,
}

impl Checkpoint {
    pub fn feed_offsets(&self) -> BTreeMap<PartitionId, Offset> {
        self.partitions
            .iter()
            .filter_map(|(p, s)| Some((*p, s.offset?)))
            .collect()
    }

    pub fn window_accumulators(&self) -> BTreeMap<WindowKey, WindowAccumulator> {
        self.partitions
            .values()
            .flat_map(|s| s.accumulators.iter().cloned())
            .collect()
    }

    pub fn watermarks(&self) -> BTreeMap<String, SystemTime> {
        self.partitions
            .values()
            .flat_map(|s| s.watermarks.iter().cloned())
            .collect()
    }

    pub fn partition(&self, partition: PartitionId) -> Option<&PartitionSnapshot> {
        self.partitions.get(&partition)
    }
}

#[macro_export]
macro_rules! retry {
    ($e:expr, $max_retries:expr, $base:expr, $max_delay:expr, |$err_var:ident| $error_handler:expr, $retry_if:expr) => {{
        use $crate::rand::Rng;
        use std::time::Duration;
        let mut retries: u32 = 0;
        loop {
            match $e {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if retries < $max_retries && $retry_if(&e) {
                        retries += 1;
                        {
                            let $err_var = e;
                            $error_handler;
                        }
                        let tmp: Duration = $max_delay.min($base * (2u32.saturating_pow(retries)));
                        let backoff = tmp / 2
                            + Duration::from_micros(
                                $crate::rand::thread_rng()
                                    .gen_range(0..=tmp.as_micros() as u64 / 2),
                            );

                        tokio::time::sleep(backoff).await;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};

    ($e:expr, $max_retries:expr, $base:expr, $max_delay:expr, |$err_var:ident| $error_handler:expr) => {
        $crate::retry!(
            $e,
            $max_retries,
            $base,
            $max_delay,
            |$err_var| $error_handler,
            |_| true
        )
    };
}
