use anyhow::{anyhow, bail};
use brook_rpc::{Checkpoint, SubtaskCheckpoint};
use brook_types::PartitionId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;
use tracing::{debug, info};

/// Collects the per-partition snapshots of an in-progress checkpoint until every subtask has
/// reported.
pub struct CheckpointState {
    checkpoint_id: u64,
    epoch: u32,
    start_time: SystemTime,
    partitions: BTreeSet<PartitionId>,
    completed: BTreeMap<PartitionId, SubtaskCheckpoint>,
}

impl CheckpointState {
    pub fn new(
        checkpoint_id: u64,
        epoch: u32,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        let partitions: BTreeSet<_> = partitions.into_iter().collect();
        info!(
            message = "Starting checkpointing",
            checkpoint_id,
            epoch,
            partitions = partitions.len()
        );

        Self {
            checkpoint_id,
            epoch,
            start_time: SystemTime::now(),
            partitions,
            completed: BTreeMap::new(),
        }
    }

    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Partitions that have not yet reported.
    pub fn pending(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions
            .iter()
            .copied()
            .filter(|p| !self.completed.contains_key(p))
    }

    pub fn checkpoint_event(&mut self, c: SubtaskCheckpoint) -> anyhow::Result<()> {
        debug!(
            message = "Checkpoint event",
            checkpoint_id = self.checkpoint_id,
            epoch = c.epoch,
            partition = c.partition,
            offset = ?c.snapshot.offset,
        );

        if c.epoch != self.epoch {
            bail!(
                "received checkpoint for epoch {} while checkpointing epoch {}",
                c.epoch,
                self.epoch
            );
        }

        if !self.partitions.contains(&c.partition) {
            bail!(
                "received checkpoint from unknown partition {}",
                c.partition
            );
        }

        if self.completed.contains_key(&c.partition) {
            bail!(
                "partition {} reported twice for epoch {}",
                c.partition,
                self.epoch
            );
        }

        self.completed.insert(c.partition, c);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.completed.len() == self.partitions.len()
    }

    /// Assembles the complete checkpoint. Fails if any partition has not reported.
    pub fn into_checkpoint(self) -> anyhow::Result<Checkpoint> {
        if let Some(missing) = self.pending().next() {
            return Err(anyhow!(
                "checkpoint {} is missing partition {}",
                self.checkpoint_id,
                missing
            ));
        }

        Ok(Checkpoint {
            checkpoint_id: self.checkpoint_id,
            created_at: SystemTime::now(),
            partitions: self
                .completed
                .into_iter()
                .map(|(partition, c)| (partition, c.snapshot))
                .collect(),
        })
    }
}
