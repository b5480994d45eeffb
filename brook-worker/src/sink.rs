use async_trait::async_trait;
use brook_metrics::{SINK_DEGRADED_GAUGE, SINK_RETRIES_COUNTER};
use brook_rpc::config::SinkConfig;
use brook_rpc::retry;
use brook_storage::{StorageError, StorageProvider};
use brook_types::{to_millis, AggregateKey, EmittedAggregate};
use object_store::path::Path;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to serialize aggregate: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gave up writing {pending} aggregates after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        pending: usize,
        source: Box<SinkError>,
    },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Unavailable(_) => true,
            SinkError::Storage(e) => e.is_retryable(),
            SinkError::Serialization(_) | SinkError::RetriesExhausted { .. } => false,
        }
    }
}

/// Durable home of emitted aggregates, keyed by `(user_id, window_start, window_end)`. Writing an
/// aggregate whose key already exists replaces the stored value.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn upsert(&self, aggregates: &[EmittedAggregate]) -> Result<(), SinkError>;

    async fn get(&self, key: &AggregateKey) -> Result<Option<EmittedAggregate>, SinkError>;

    /// All aggregates for a user, ordered by window.
    async fn range_for_user(&self, user_id: &str) -> Result<Vec<EmittedAggregate>, SinkError>;

    /// Aggregates whose window ends after `since`.
    async fn recent(&self, since: SystemTime) -> Result<Vec<EmittedAggregate>, SinkError>;
}

pub async fn aggregate_store_for_url(url: &str) -> Result<Arc<dyn AggregateStore>, SinkError> {
    if url == "memory" {
        return Ok(Arc::new(MemoryAggregateStore::new()));
    }

    Ok(Arc::new(ObjectAggregateStore::new(
        StorageProvider::for_url(url).await?,
    )))
}

#[derive(Default)]
struct MemoryStoreInner {
    aggregates: BTreeMap<AggregateKey, EmittedAggregate>,
    fail_next: usize,
    writes: usize,
}

/// An in-process aggregate store. Failures can be injected to exercise retry handling.
#[derive(Default, Clone)]
pub struct MemoryAggregateStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `upsert` fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().unwrap().fail_next = n;
    }

    pub fn contents(&self) -> BTreeMap<AggregateKey, EmittedAggregate> {
        self.inner.lock().unwrap().aggregates.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful `upsert` calls.
    pub fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn upsert(&self, aggregates: &[EmittedAggregate]) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }

        for agg in aggregates {
            inner.aggregates.insert(agg.key(), agg.clone());
        }
        inner.writes += 1;
        Ok(())
    }

    async fn get(&self, key: &AggregateKey) -> Result<Option<EmittedAggregate>, SinkError> {
        Ok(self.inner.lock().unwrap().aggregates.get(key).cloned())
    }

    async fn range_for_user(&self, user_id: &str) -> Result<Vec<EmittedAggregate>, SinkError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .aggregates
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn recent(&self, since: SystemTime) -> Result<Vec<EmittedAggregate>, SinkError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .aggregates
            .values()
            .filter(|a| a.window_end > since)
            .cloned()
            .collect())
    }
}

const AGGREGATES_PREFIX: &str = "aggregates";

/// Stores each aggregate as a JSON object at `aggregates/{user}/{start}-{end}.json`, with window
/// bounds in epoch millis.
pub struct ObjectAggregateStore {
    storage: StorageProvider,
}

impl ObjectAggregateStore {
    pub fn new(storage: StorageProvider) -> Self {
        Self { storage }
    }

    fn path(user_id: &str, window_start: SystemTime, window_end: SystemTime) -> Path {
        Path::from(AGGREGATES_PREFIX).child(user_id).child(format!(
            "{}-{}.json",
            to_millis(window_start),
            to_millis(window_end)
        ))
    }

    fn window_end_of(path: &Path) -> Option<u64> {
        let (_, end) = path.filename()?.strip_suffix(".json")?.split_once('-')?;
        end.parse().ok()
    }

    async fn read_all(&self, paths: Vec<Path>) -> Result<Vec<EmittedAggregate>, SinkError> {
        let mut aggregates = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(bytes) = self.storage.get_if_present(path).await? {
                aggregates.push(serde_json::from_slice(&bytes)?);
            }
        }
        aggregates.sort_by(|a: &EmittedAggregate, b| a.key().cmp(&b.key()));
        Ok(aggregates)
    }
}

#[async_trait]
impl AggregateStore for ObjectAggregateStore {
    async fn upsert(&self, aggregates: &[EmittedAggregate]) -> Result<(), SinkError> {
        for agg in aggregates {
            let path = Self::path(&agg.user_id, agg.window_start, agg.window_end);
            self.storage
                .try_put(path, serde_json::to_vec(agg)?)
                .await?;
        }
        Ok(())
    }

    async fn get(&self, key: &AggregateKey) -> Result<Option<EmittedAggregate>, SinkError> {
        let path = Self::path(&key.user_id, key.window_start, key.window_end);
        match self.storage.get_if_present(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn range_for_user(&self, user_id: &str) -> Result<Vec<EmittedAggregate>, SinkError> {
        let prefix = Path::from(AGGREGATES_PREFIX).child(user_id);
        let paths = self.storage.list(Some(&prefix)).await?;
        self.read_all(paths).await
    }

    async fn recent(&self, since: SystemTime) -> Result<Vec<EmittedAggregate>, SinkError> {
        let since = to_millis(since);
        let paths = self
            .storage
            .list(Some(&Path::from(AGGREGATES_PREFIX)))
            .await?
            .into_iter()
            .filter(|p| Self::window_end_of(p).is_some_and(|end| end > since))
            .collect();
        self.read_all(paths).await
    }
}

/// Buffers emitted aggregates and applies them to an [AggregateStore] in batches. Only the most
/// recent emission for each window is kept while buffered.
pub struct SinkWriter {
    store: Arc<dyn AggregateStore>,
    pending: BTreeMap<AggregateKey, EmittedAggregate>,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    last_flush: Instant,
}

impl SinkWriter {
    pub fn new(store: Arc<dyn AggregateStore>, config: &SinkConfig) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            batch_size: config.batch_size.max(1),
            flush_interval: *config.flush_interval,
            max_retries: config.max_retries,
            initial_backoff: *config.initial_backoff,
            max_backoff: *config.max_backoff,
            last_flush: Instant::now(),
        }
    }

    pub fn write(&mut self, aggregate: EmittedAggregate) {
        self.pending.insert(aggregate.key(), aggregate);
    }

    pub fn write_all(&mut self, aggregates: impl IntoIterator<Item = EmittedAggregate>) {
        for agg in aggregates {
            self.write(agg);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.batch_size
            || (!self.pending.is_empty() && self.last_flush.elapsed() >= self.flush_interval)
    }

    /// Time left until the flush interval elapses.
    pub fn time_to_flush(&self) -> Duration {
        self.flush_interval.saturating_sub(self.last_flush.elapsed())
    }

    /// Writes every pending aggregate, retrying transient failures with backoff. On error the
    /// pending aggregates are retained.
    pub async fn flush(&mut self) -> Result<usize, SinkError> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch: Vec<_> = self.pending.values().cloned().collect();
        let mut attempts = 0;

        let result = retry!(
            {
                attempts += 1;
                self.store.upsert(&batch).await
            },
            self.max_retries,
            self.initial_backoff,
            self.max_backoff,
            |e| {
                SINK_RETRIES_COUNTER.inc();
                SINK_DEGRADED_GAUGE.set(1);
                warn!(
                    message = "failed to write aggregates, retrying",
                    attempts,
                    pending = batch.len(),
                    error = %e
                );
            },
            |e: &SinkError| e.is_retryable()
        );

        match result {
            Ok(()) => {
                SINK_DEGRADED_GAUGE.set(0);
                debug!(message = "flushed aggregates", count = batch.len(), attempts);
                self.pending.clear();
                Ok(batch.len())
            }
            Err(e) if e.is_retryable() => {
                error!(
                    message = "exhausted retries writing aggregates",
                    attempts,
                    pending = batch.len(),
                    error = %e
                );
                Err(SinkError::RetriesExhausted {
                    attempts,
                    pending: batch.len(),
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }
}
