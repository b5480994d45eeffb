use anyhow::{anyhow, bail, Context};
use brook_metrics::{CHECKPOINTS_COMPLETED_COUNTER, CHECKPOINT_DURATION_HISTOGRAM};
use brook_rpc::{ControlMessage, ControlResp};
use brook_state::{CheckpointState, CheckpointStore};
use brook_types::{CheckpointBarrier, PartitionId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant, SystemTime};
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives checkpointing for every partition subtask of an engine. Barriers are injected on a
/// wall-clock interval or when a subtask asks for one; the checkpoint is written once every
/// subtask has reported its state for the barrier's epoch.
pub struct CheckpointCoordinator {
    store: CheckpointStore,
    controls: BTreeMap<PartitionId, Sender<ControlMessage>>,
    resp_rx: Receiver<ControlResp>,
    interval: Duration,
    token: CancellationToken,
    epoch: u32,
    next_checkpoint_id: u64,
    checkpoint_state: Option<CheckpointState>,
    last_checkpoint: Instant,
    stopping: bool,
    ended: BTreeSet<PartitionId>,
}

impl CheckpointCoordinator {
    pub fn new(
        store: CheckpointStore,
        controls: BTreeMap<PartitionId, Sender<ControlMessage>>,
        resp_rx: Receiver<ControlResp>,
        interval: Duration,
        next_checkpoint_id: u64,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            controls,
            resp_rx,
            interval,
            token,
            epoch: 0,
            next_checkpoint_id,
            checkpoint_state: None,
            last_checkpoint: Instant::now(),
            stopping: false,
            ended: BTreeSet::new(),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    fn all_ended(&self) -> bool {
        self.ended.len() == self.controls.len()
    }

    /// Runs until the final checkpoint has been written, or fails if a subtask fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let result = self.run_loop().await;
        if result.is_err() {
            self.stop_all().await;
        }
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval((self.interval / 4).max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let token = self.token.clone();
        let mut stop_requested = false;

        loop {
            select! {
                _ = ticker.tick() => {
                    if self.last_checkpoint.elapsed() >= self.interval {
                        self.checkpoint(false).await?;
                    }
                }
                _ = token.cancelled(), if !stop_requested => {
                    info!(message = "stop requested, taking final checkpoint", epoch = self.epoch);
                    stop_requested = true;
                }
                resp = self.resp_rx.recv() => {
                    let resp = resp.ok_or_else(|| anyhow!("all subtasks exited before the final checkpoint"))?;
                    if self.handle_message(resp).await? {
                        return Ok(());
                    }
                }
            }

            if stop_requested || self.all_ended() {
                self.checkpoint(true).await?;
            }
        }
    }

    /// Starts a checkpoint unless one is already in progress.
    pub async fn checkpoint(&mut self, then_stop: bool) -> anyhow::Result<()> {
        if self.stopping || self.checkpoint_state.is_some() {
            return Ok(());
        }

        self.epoch += 1;
        let barrier = CheckpointBarrier {
            epoch: self.epoch,
            timestamp: SystemTime::now(),
            then_stop,
        };

        let state = CheckpointState::new(
            self.next_checkpoint_id,
            self.epoch,
            self.controls.keys().copied(),
        );

        for (partition, tx) in &self.controls {
            tx.send(ControlMessage::Checkpoint(barrier))
                .await
                .map_err(|_| anyhow!("subtask for partition {} has exited", partition))?;
        }

        self.checkpoint_state = Some(state);
        self.stopping = then_stop;
        Ok(())
    }

    /// Returns true once the final checkpoint is durable.
    async fn handle_message(&mut self, msg: ControlResp) -> anyhow::Result<bool> {
        match msg {
            ControlResp::CheckpointCompleted(c) => {
                let Some(state) = self.checkpoint_state.as_mut() else {
                    warn!(
                        message = "received checkpoint with no checkpoint in progress",
                        partition = c.partition,
                        epoch = c.epoch
                    );
                    return Ok(false);
                };

                state.checkpoint_event(c)?;
                if state.done() {
                    self.finish_checkpoint().await?;
                    return Ok(self.stopping);
                }
            }
            ControlResp::CheckpointRequested { partition } => {
                debug!(message = "checkpoint requested", partition);
                self.checkpoint(false).await?;
            }
            ControlResp::EndOfData { partition } => {
                info!(message = "partition reached end of data", partition);
                self.ended.insert(partition);
            }
            ControlResp::TaskFinished { partition } => {
                if !self.stopping {
                    bail!(
                        "subtask for partition {} finished before the final checkpoint",
                        partition
                    );
                }
            }
            ControlResp::TaskFailed { partition, error } => {
                error!(message = "subtask failed", partition, error = %error);
                bail!("subtask for partition {} failed: {}", partition, error);
            }
        }

        Ok(false)
    }

    async fn finish_checkpoint(&mut self) -> anyhow::Result<()> {
        let Some(state) = self.checkpoint_state.take() else {
            return Ok(());
        };

        let start_time = state.start_time();
        let checkpoint = state.into_checkpoint()?;
        let checkpoint_id = checkpoint.checkpoint_id;
        self.next_checkpoint_id += 1;
        self.last_checkpoint = Instant::now();

        match self.store.write(&checkpoint).await {
            Ok(()) => {
                let duration = start_time.elapsed().unwrap_or(Duration::ZERO).as_secs_f64();
                CHECKPOINTS_COMPLETED_COUNTER.inc();
                CHECKPOINT_DURATION_HISTOGRAM.observe(duration);
                info!(
                    message = "Finished checkpointing",
                    checkpoint_id,
                    epoch = self.epoch,
                    duration
                );
                Ok(())
            }
            Err(e) if !self.stopping => {
                // the previous checkpoint remains valid; the next interval tries again
                warn!(
                    message = "failed to write checkpoint",
                    checkpoint_id,
                    epoch = self.epoch,
                    error = %e
                );
                Ok(())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to write final checkpoint {checkpoint_id}"))
            }
        }
    }

    async fn stop_all(&self) {
        for tx in self.controls.values() {
            let _ = tx.send(ControlMessage::Stop).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_rpc::{PartitionSnapshot, SubtaskCheckpoint};
    use tokio::sync::mpsc::channel;

    struct Harness {
        controls: Vec<Receiver<ControlMessage>>,
        resp_tx: Sender<ControlResp>,
        store: CheckpointStore,
        token: CancellationToken,
        _dir: tempfile::TempDir,
    }

    async fn coordinator(partitions: u32, interval: Duration) -> (CheckpointCoordinator, Harness) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_url(dir.path().to_str().unwrap(), 2)
            .await
            .unwrap();

        let mut senders = BTreeMap::new();
        let mut controls = vec![];
        for p in 0..partitions {
            let (tx, rx) = channel(8);
            senders.insert(p, tx);
            controls.push(rx);
        }
        let (resp_tx, resp_rx) = channel(8);
        let token = CancellationToken::new();

        (
            CheckpointCoordinator::new(
                store.clone(),
                senders,
                resp_rx,
                interval,
                1,
                token.clone(),
            ),
            Harness {
                controls,
                resp_tx,
                store,
                token,
                _dir: dir,
            },
        )
    }

    async fn respond(h: &mut Harness, partition: u32, offset: u64) -> CheckpointBarrier {
        let Some(ControlMessage::Checkpoint(barrier)) = h.controls[partition as usize].recv().await
        else {
            panic!("expected a barrier");
        };
        h.resp_tx
            .send(ControlResp::CheckpointCompleted(SubtaskCheckpoint {
                partition,
                epoch: barrier.epoch,
                start_time: barrier.timestamp,
                finish_time: SystemTime::now(),
                snapshot: PartitionSnapshot {
                    offset: Some(offset),
                    ..Default::default()
                },
            }))
            .await
            .unwrap();
        barrier
    }

    #[tokio::test]
    async fn test_interval_checkpoint_then_final_on_cancel() {
        let (coordinator, mut h) = coordinator(2, Duration::from_millis(50)).await;
        let handle = tokio::spawn(coordinator.run());

        let first = respond(&mut h, 0, 3).await;
        respond(&mut h, 1, 5).await;
        assert_eq!(first.epoch, 1);
        assert!(!first.then_stop);

        // wait for the first checkpoint to become durable before stopping
        while h.store.list().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.token.cancel();

        // a barrier from another interval may race the cancellation
        let mut last = respond(&mut h, 0, 4).await;
        respond(&mut h, 1, 6).await;
        if !last.then_stop {
            last = respond(&mut h, 0, 4).await;
            respond(&mut h, 1, 6).await;
        }
        assert!(last.then_stop);

        handle.await.unwrap().unwrap();
        let latest = h.store.load_latest_valid().await.unwrap().unwrap();
        assert_eq!(
            latest.feed_offsets(),
            [(0, 4), (1, 6)].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_requested_checkpoint() {
        let (coordinator, mut h) = coordinator(1, Duration::from_secs(3600)).await;
        let handle = tokio::spawn(coordinator.run());

        h.resp_tx
            .send(ControlResp::CheckpointRequested { partition: 0 })
            .await
            .unwrap();
        let barrier = respond(&mut h, 0, 10).await;
        assert_eq!(barrier.epoch, 1);

        h.resp_tx
            .send(ControlResp::EndOfData { partition: 0 })
            .await
            .unwrap();
        assert!(respond(&mut h, 0, 10).await.then_stop);

        handle.await.unwrap().unwrap();
        assert_eq!(h.store.list().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_task_failure_stops_everything() {
        let (coordinator, mut h) = coordinator(2, Duration::from_secs(3600)).await;
        let handle = tokio::spawn(coordinator.run());

        h.resp_tx
            .send(ControlResp::TaskFailed {
                partition: 1,
                error: "window state capacity exceeded".to_string(),
            })
            .await
            .unwrap();

        assert!(handle.await.unwrap().is_err());
        assert!(matches!(
            h.controls[0].recv().await,
            Some(ControlMessage::Stop)
        ));
        assert!(h.store.list().await.unwrap().is_empty());
    }
}
