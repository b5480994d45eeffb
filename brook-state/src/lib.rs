use bincode::config::Configuration;
use thiserror::Error;

pub mod checkpoint_state;
pub mod checkpoint_store;
pub mod offsets;
pub mod tables;

pub use checkpoint_state::CheckpointState;
pub use checkpoint_store::{CheckpointError, CheckpointStore};
pub use offsets::OffsetCursor;
pub use tables::{StateBudget, WindowStateStore};

pub const BINCODE_CONFIG: Configuration = bincode::config::standard();

#[derive(Error, Debug)]
pub enum StateError {
    /// Creating another window accumulator would exceed the configured bound on live window
    /// state. Either the watermark is not advancing or lateness is misconfigured for the key
    /// cardinality.
    #[error("window state capacity of {limit} accumulators exceeded")]
    CapacityExceeded { limit: usize },

    #[error("restored state contains duplicate window {0}")]
    DuplicateWindow(String),
}
