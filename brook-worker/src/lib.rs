pub mod coordinator;
pub mod engine;
pub mod feed;
pub mod pipeline;
pub mod sink;
pub mod watermark;
pub mod windows;

pub use coordinator::CheckpointCoordinator;
pub use engine::{Engine, RunningEngine};
pub use feed::{Feed, FeedBatch, FeedEntry, FileFeed, MemoryFeed};
pub use pipeline::{EventFilter, Pipeline};
pub use sink::{
    aggregate_store_for_url, AggregateStore, MemoryAggregateStore, ObjectAggregateStore,
    SinkError, SinkWriter,
};
pub use watermark::WatermarkTracker;
pub use windows::{SlidingWindowAssigner, TimeWindowAssigner, TumblingWindowAssigner};
