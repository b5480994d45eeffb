use brook_rpc::config::{Config, FilterConfig};
use brook_state::{CheckpointStore, StateBudget};
use brook_types::{from_millis, to_millis, ActivityRecord, EmittedAggregate, EventType};
use brook_worker::{Engine, MemoryAggregateStore, MemoryFeed, Pipeline};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PARTITIONS: u32 = 2;

// (user, window start ms, window end ms) -> (count, sum, final)
type Results = BTreeMap<(String, u64, u64), (u64, f64, bool)>;

fn config(stop_at_end: bool) -> Config {
    let mut config = Config::defaults();
    config.window.width = Duration::from_secs(60).into();
    config.window.slide = Some(Duration::from_secs(30).into());
    config.window.allowed_lateness = Duration::from_secs(5).into();
    config.checkpoint.interval = Duration::from_millis(20).into();
    config.sink.batch_size = 8;
    config.sink.flush_interval = Duration::from_millis(10).into();
    config.sink.max_retries = 2;
    config.sink.initial_backoff = Duration::from_millis(1).into();
    config.sink.max_backoff = Duration::from_millis(2).into();
    config.feed.batch_size = 16;
    config.feed.poll_interval = Duration::from_millis(5).into();
    config.feed.stop_at_end = stop_at_end;
    config
}

fn records() -> Vec<ActivityRecord> {
    let mut records = vec![];
    for i in 0..150u64 {
        for u in 0..6 {
            let event_type = if (i + u) % 5 == 0 {
                EventType::Purchase
            } else {
                EventType::PageView
            };
            records.push(
                ActivityRecord::new(
                    format!("user_{}", u),
                    "session",
                    from_millis(i * 2_000 + u * 13),
                    event_type,
                )
                .unwrap()
                .with_value(i as f64),
            );
        }
    }
    records
}

fn partition_of(record: &ActivityRecord) -> u32 {
    record
        .user_id()
        .trim_start_matches("user_")
        .parse::<u32>()
        .unwrap()
        % PARTITIONS
}

fn append(feed: &MemoryFeed, records: &[ActivityRecord]) {
    for r in records {
        feed.append_record(partition_of(r), r).unwrap();
    }
}

fn summarize<'a>(aggregates: impl IntoIterator<Item = &'a EmittedAggregate>) -> Results {
    aggregates
        .into_iter()
        .map(|a| {
            (
                (
                    a.user_id.clone(),
                    to_millis(a.window_start),
                    to_millis(a.window_end),
                ),
                (a.count, a.sum, a.is_final),
            )
        })
        .collect()
}

/// What a single uninterrupted pass over the feed produces.
fn reference(config: &Config, records: &[ActivityRecord]) -> Results {
    let budget = StateBudget::new(config.window.max_window_state);
    let mut results = Results::new();

    for partition in 0..PARTITIONS {
        let mut p = Pipeline::new(partition, &config.window, &config.filter, budget.clone())
            .unwrap();
        let mut emitted = vec![];
        for (offset, r) in records
            .iter()
            .filter(|r| partition_of(r) == partition)
            .enumerate()
        {
            emitted.extend(p.ingest(r, offset as u64).unwrap());
        }
        emitted.extend(p.finish());
        results.extend(summarize(&emitted));
    }

    results
}

async fn checkpoint_store(dir: &tempfile::TempDir) -> CheckpointStore {
    CheckpointStore::for_url(dir.path().to_str().unwrap(), 3)
        .await
        .unwrap()
}

#[tokio::test]
async fn runs_bounded_feed_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(true);
    let records = records();

    let feed = MemoryFeed::new(PARTITIONS);
    append(&feed, &records);
    feed.seal_all();
    let store = MemoryAggregateStore::new();

    Engine::new(
        &config,
        Arc::new(feed.clone()),
        Arc::new(store.clone()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    let results = summarize(store.contents().values());
    assert_eq!(results, reference(&config, &records));
    assert!(results.values().all(|(_, _, is_final)| *is_final));

    // only PAGE_VIEW records are aggregated by default
    let total: u64 = results
        .iter()
        .filter(|((_, start, _), _)| start % 60_000 == 0)
        .map(|(_, (count, _, _))| count)
        .sum();
    let page_views = records
        .iter()
        .filter(|r| r.event_type() == &EventType::PageView)
        .count() as u64;
    assert_eq!(total, page_views);

    let checkpoint = checkpoint_store(&dir)
        .await
        .load_latest_valid()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        checkpoint.feed_offsets(),
        (0..PARTITIONS)
            .map(|p| (p, feed.len(p) as u64 - 1))
            .collect()
    );
    assert!(checkpoint.window_accumulators().is_empty());
}

#[tokio::test]
async fn restart_after_stop_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let records = records();
    let (head, tail) = records.split_at(records.len() / 2);

    let feed = MemoryFeed::new(PARTITIONS);
    let store = MemoryAggregateStore::new();
    append(&feed, head);

    // first run is stopped while the feed is still open
    let token = CancellationToken::new();
    let running = Engine::new(
        &config(false),
        Arc::new(feed.clone()),
        Arc::new(store.clone()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .start(token.clone())
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    running.join().await.unwrap();

    assert!(checkpoint_store(&dir)
        .await
        .load_latest_valid()
        .await
        .unwrap()
        .is_some());

    // the second run picks up from the final checkpoint, with redelivery of old offsets
    append(&feed, tail);
    feed.seal_all();
    feed.set_redelivery(10);

    Engine::new(
        &config(true),
        Arc::new(feed.clone()),
        Arc::new(store.clone()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(
        summarize(store.contents().values()),
        reference(&config(true), &records)
    );
}

#[tokio::test]
async fn replaying_the_feed_twice_leaves_the_same_aggregates() {
    let records = records();
    let feed = MemoryFeed::new(PARTITIONS);
    append(&feed, &records);
    feed.seal_all();
    let store = MemoryAggregateStore::new();

    let mut states = vec![];
    for _ in 0..2 {
        // a fresh checkpoint directory each time replays everything from offset 0
        let dir = tempfile::tempdir().unwrap();
        Engine::new(
            &config(true),
            Arc::new(feed.clone()),
            Arc::new(store.clone()),
            checkpoint_store(&dir).await,
        )
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
        states.push(summarize(store.contents().values()));
    }

    assert_eq!(states[0], states[1]);
}

#[tokio::test]
async fn malformed_payloads_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let feed = MemoryFeed::new(1);
    let mut config = config(true);
    config.filter = FilterConfig::default();

    let record = |user: &str, ts: u64| {
        ActivityRecord::new(user, "s", from_millis(ts), EventType::AddToCart).unwrap()
    };
    feed.append_record(0, &record("a", 1_000)).unwrap();
    feed.append(0, "{\"userId\": \"a\"}").unwrap();
    feed.append(0, "garbage").unwrap();
    feed.append_record(0, &record("a", 2_000)).unwrap();
    feed.seal_all();

    let store = MemoryAggregateStore::new();
    Engine::new(
        &config,
        Arc::new(feed),
        Arc::new(store.clone()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    let results = summarize(store.contents().values());
    assert_eq!(results[&("a".to_string(), 0, 60_000)].0, 2);
}

#[tokio::test]
async fn exceeding_window_state_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(true);
    config.window.max_window_state = 4;

    let feed = MemoryFeed::new(PARTITIONS);
    append(&feed, &records());
    feed.seal_all();

    let err = Engine::new(
        &config,
        Arc::new(feed),
        Arc::new(MemoryAggregateStore::new()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap_err();

    assert!(
        format!("{:#}", err).contains("capacity"),
        "unexpected error: {:#}",
        err
    );
}

#[tokio::test]
async fn exhausted_sink_retries_halt_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let feed = MemoryFeed::new(PARTITIONS);
    append(&feed, &records());
    feed.seal_all();

    let store = MemoryAggregateStore::new();
    store.fail_next(usize::MAX);

    let err = Engine::new(
        &config(true),
        Arc::new(feed),
        Arc::new(store.clone()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap_err();

    assert!(format!("{:#}", err).contains("gave up"), "{:#}", err);
    assert!(store.is_empty());
}

#[tokio::test]
async fn startup_fails_without_a_valid_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("checkpoint-00000000000000000001.bin"),
        b"not a checkpoint",
    )
    .unwrap();

    let feed = MemoryFeed::new(1);
    let result = Engine::new(
        &config(true),
        Arc::new(feed),
        Arc::new(MemoryAggregateStore::new()),
        checkpoint_store(&dir).await,
    )
    .unwrap()
    .start(CancellationToken::new())
    .await;

    assert!(result.is_err());
}

#[test]
fn invalid_windows_are_rejected_at_construction() {
    let mut config = config(true);
    config.window.slide = Some(Duration::ZERO.into());

    assert!(Engine::new(
        &config,
        Arc::new(MemoryFeed::new(1)),
        Arc::new(MemoryAggregateStore::new()),
        CheckpointStore::new(
            brook_storage::StorageProvider::for_object_store(Arc::new(
                object_store::memory::InMemory::new()
            )),
            2
        ),
    )
    .is_err());
}
