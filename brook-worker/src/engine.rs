use crate::coordinator::CheckpointCoordinator;
use crate::feed::Feed;
use crate::pipeline::Pipeline;
use crate::sink::{AggregateStore, SinkWriter};
use anyhow::{anyhow, Context};
use brook_rpc::config::{Config, ConfigError};
use brook_rpc::{ControlMessage, ControlResp, SubtaskCheckpoint};
use brook_state::{CheckpointStore, StateBudget};
use brook_types::{CheckpointBarrier, PartitionId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::select;
use tokio::sync::mpsc::{channel, error::TryRecvError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONTROL_QUEUE_SIZE: usize = 16;

/// A single-node aggregation engine: one subtask per feed partition plus a checkpoint
/// coordinator.
pub struct Engine {
    config: Config,
    feed: Arc<dyn Feed>,
    store: Arc<dyn AggregateStore>,
    checkpoints: CheckpointStore,
}

pub struct RunningEngine {
    coordinator: JoinHandle<anyhow::Result<()>>,
    subtasks: Vec<(PartitionId, JoinHandle<anyhow::Result<()>>)>,
}

impl RunningEngine {
    /// Waits for the engine to stop. A subtask failure is reported in preference to the
    /// coordinator error it causes.
    pub async fn join(self) -> anyhow::Result<()> {
        let coordinator = self
            .coordinator
            .await
            .map_err(|e| anyhow!("checkpoint coordinator panicked: {:?}", e))
            .and_then(|r| r);

        let mut failure = None;
        for (partition, handle) in self.subtasks {
            let r = handle
                .await
                .map_err(|e| anyhow!("subtask for partition {} panicked: {:?}", partition, e))
                .and_then(|r| r);

            if let Err(e) = r {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => coordinator,
        }
    }
}

impl Engine {
    pub fn new(
        config: &Config,
        feed: Arc<dyn Feed>,
        store: Arc<dyn AggregateStore>,
        checkpoints: CheckpointStore,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config: config.clone(),
            feed,
            store,
            checkpoints,
        })
    }

    /// Restores from the latest valid checkpoint and starts processing. Cancelling `token`
    /// takes a final checkpoint and stops the engine.
    pub async fn start(self, token: CancellationToken) -> anyhow::Result<RunningEngine> {
        let restored = self
            .checkpoints
            .load_latest_valid()
            .await
            .context("failed to recover from checkpoint")?;

        let next_checkpoint_id = match &restored {
            Some(c) => {
                info!(
                    message = "recovering from checkpoint",
                    checkpoint_id = c.checkpoint_id,
                    offsets = ?c.feed_offsets()
                );
                c.checkpoint_id + 1
            }
            None => {
                info!("no checkpoint found, starting from the beginning of the feed");
                self.checkpoints.next_checkpoint_id().await?
            }
        };

        let partitions = self.feed.partitions();
        if partitions.is_empty() {
            return Err(anyhow!("feed has no partitions"));
        }

        let budget = StateBudget::new(self.config.window.max_window_state);
        let (resp_tx, resp_rx) = channel(partitions.len() * 4 + CONTROL_QUEUE_SIZE);

        let mut controls = BTreeMap::new();
        let mut subtasks = vec![];
        for partition in partitions {
            let mut pipeline = Pipeline::new(
                partition,
                &self.config.window,
                &self.config.filter,
                budget.clone(),
            )?;

            if let Some(snapshot) = restored.as_ref().and_then(|c| c.partition(partition)) {
                pipeline.restore(snapshot)?;
            }

            let (control_tx, control_rx) = channel(CONTROL_QUEUE_SIZE);
            controls.insert(partition, control_tx);

            let subtask = Subtask {
                partition,
                pipeline,
                sink: SinkWriter::new(self.store.clone(), &self.config.sink),
                feed: self.feed.clone(),
                control_rx,
                resp_tx: resp_tx.clone(),
                batch_size: self.config.feed.batch_size.max(1),
                poll_interval: *self.config.feed.poll_interval,
                stop_at_end: self.config.feed.stop_at_end,
                every_records: self.config.checkpoint.every_records,
                since_checkpoint: 0,
                checkpoint_requested: false,
            };
            subtasks.push((partition, tokio::spawn(subtask.run())));
        }

        info!(
            message = "engine started",
            partitions = subtasks.len(),
            max_window_state = budget.limit()
        );

        let coordinator = CheckpointCoordinator::new(
            self.checkpoints,
            controls,
            resp_rx,
            *self.config.checkpoint.interval,
            next_checkpoint_id,
            token,
        );

        Ok(RunningEngine {
            coordinator: tokio::spawn(coordinator.run()),
            subtasks,
        })
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        self.start(token).await?.join().await
    }
}

struct Subtask {
    partition: PartitionId,
    pipeline: Pipeline,
    sink: SinkWriter,
    feed: Arc<dyn Feed>,
    control_rx: Receiver<ControlMessage>,
    resp_tx: Sender<ControlResp>,
    batch_size: usize,
    poll_interval: Duration,
    stop_at_end: bool,
    every_records: Option<u64>,
    since_checkpoint: u64,
    checkpoint_requested: bool,
}

impl Subtask {
    async fn run(mut self) -> anyhow::Result<()> {
        let result = self.run_loop().await;
        let partition = self.partition;

        let resp = match &result {
            Ok(()) => ControlResp::TaskFinished { partition },
            Err(e) => ControlResp::TaskFailed {
                partition,
                error: format!("{:#}", e),
            },
        };
        // the coordinator may already be gone once the final checkpoint is written
        let _ = self.resp_tx.send(resp).await;

        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        let mut idle = false;
        let mut ended = false;

        loop {
            let feed = self.feed.clone();
            let partition = self.partition;
            let from = self.pipeline.next_offset();
            let max = self.batch_size;
            let delay = if idle { self.poll_interval } else { Duration::ZERO };
            let read = async move {
                if ended {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(delay).await;
                feed.read(partition, from, max).await
            };

            let flush_pending = self.sink.pending_len() > 0;
            let flush_in = self.sink.time_to_flush();

            select! {
                biased;
                msg = self.control_rx.recv() => {
                    let Some(msg) = msg else {
                        warn!(message = "control channel closed, stopping", partition);
                        return Ok(());
                    };
                    if self.handle_control(msg).await? {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(flush_in), if flush_pending => {
                    self.sink.flush().await?;
                }
                batch = read => {
                    let batch = batch.with_context(|| format!("failed to read partition {}", partition))?;

                    let mut progressed = false;
                    for entry in batch.entries {
                        // barriers are handled between records
                        loop {
                            match self.control_rx.try_recv() {
                                Ok(msg) => {
                                    if self.handle_control(msg).await? {
                                        return Ok(());
                                    }
                                }
                                Err(TryRecvError::Empty) => break,
                                Err(TryRecvError::Disconnected) => return Ok(()),
                            }
                        }

                        if entry.offset >= self.pipeline.next_offset() {
                            progressed = true;
                        }
                        let emitted = self.pipeline.ingest_payload(&entry.payload, entry.offset)?;
                        self.sink.write_all(emitted);
                        if self.sink.should_flush() {
                            self.sink.flush().await?;
                        }
                        self.record_processed().await?;
                    }

                    if batch.end_of_data && self.stop_at_end && !ended {
                        self.end_of_data().await?;
                        ended = true;
                    }
                    idle = !progressed;
                }
            }
        }
    }

    async fn record_processed(&mut self) -> anyhow::Result<()> {
        let Some(every) = self.every_records else {
            return Ok(());
        };

        self.since_checkpoint += 1;
        if self.since_checkpoint >= every && !self.checkpoint_requested {
            self.checkpoint_requested = true;
            self.resp_tx
                .send(ControlResp::CheckpointRequested {
                    partition: self.partition,
                })
                .await
                .map_err(|_| anyhow!("checkpoint coordinator has exited"))?;
        }
        Ok(())
    }

    async fn end_of_data(&mut self) -> anyhow::Result<()> {
        let finals = self.pipeline.finish();
        self.sink.write_all(finals);
        self.sink.flush().await?;

        self.resp_tx
            .send(ControlResp::EndOfData {
                partition: self.partition,
            })
            .await
            .map_err(|_| anyhow!("checkpoint coordinator has exited"))
    }

    /// Returns true when the subtask should stop.
    async fn handle_control(&mut self, msg: ControlMessage) -> anyhow::Result<bool> {
        match msg {
            ControlMessage::Checkpoint(barrier) => {
                self.checkpoint(barrier).await?;
                Ok(barrier.then_stop)
            }
            ControlMessage::Stop => {
                info!(message = "stopping", partition = self.partition);
                Ok(true)
            }
        }
    }

    async fn checkpoint(&mut self, barrier: CheckpointBarrier) -> anyhow::Result<()> {
        // every aggregate produced by the offsets in this snapshot must be durable first
        self.sink.flush().await?;
        let snapshot = self.pipeline.snapshot();

        debug!(
            message = "checkpointing partition",
            partition = self.partition,
            epoch = barrier.epoch,
            offset = ?snapshot.offset,
            windows = snapshot.accumulators.len()
        );

        self.resp_tx
            .send(ControlResp::CheckpointCompleted(SubtaskCheckpoint {
                partition: self.partition,
                epoch: barrier.epoch,
                start_time: barrier.timestamp,
                finish_time: SystemTime::now(),
                snapshot,
            }))
            .await
            .map_err(|_| anyhow!("checkpoint coordinator has exited"))?;

        self.since_checkpoint = 0;
        self.checkpoint_requested = false;
        Ok(())
    }
}
