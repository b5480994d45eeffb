use crate::BINCODE_CONFIG;
use brook_rpc::Checkpoint;
use brook_storage::{StorageError, StorageProvider};
use object_store::path::Path;
use sha2::{Digest, Sha256};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"BRK1";
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + DIGEST_LEN;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("checkpoint {id} is corrupt: {reason}")]
    Corrupt { id: u64, reason: String },

    #[error("found {count} checkpoints but none of them is valid")]
    NoValidCheckpoint { count: usize },
}

/// Serializes a checkpoint as `MAGIC | sha256(body) | body`, where body is the bincode encoding.
pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Vec<u8>, CheckpointError> {
    let body = bincode::encode_to_vec(checkpoint, BINCODE_CONFIG)?;
    let digest = Sha256::digest(&body);

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&digest);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode_checkpoint(id: u64, bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let corrupt = |reason: String| CheckpointError::Corrupt { id, reason };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("truncated to {} bytes", bytes.len())));
    }

    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }

    let (expected, body) = rest.split_at(DIGEST_LEN);
    let actual = Sha256::digest(body);
    if actual.as_slice() != expected {
        return Err(corrupt(format!(
            "checksum mismatch: expected {}, found {}",
            hex::encode(expected),
            hex::encode(actual)
        )));
    }

    let (checkpoint, read): (Checkpoint, usize) =
        bincode::decode_from_slice(body, BINCODE_CONFIG).map_err(|e| corrupt(e.to_string()))?;

    if read != body.len() {
        return Err(corrupt(format!(
            "{} trailing bytes after checkpoint",
            body.len() - read
        )));
    }

    if checkpoint.checkpoint_id != id {
        return Err(corrupt(format!(
            "contains checkpoint id {}",
            checkpoint.checkpoint_id
        )));
    }

    Ok(checkpoint)
}

fn checkpoint_path(id: u64) -> Path {
    Path::from(format!("checkpoint-{:020}.bin", id))
}

fn parse_checkpoint_id(path: &Path) -> Option<u64> {
    path.filename()?
        .strip_prefix("checkpoint-")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Durable storage for checkpoints. Each checkpoint is a single object named by its id; ids
/// increase monotonically.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: StorageProvider,
    retained: usize,
}

impl CheckpointStore {
    pub fn new(storage: StorageProvider, retained: usize) -> Self {
        Self {
            storage,
            retained: retained.max(1),
        }
    }

    pub async fn for_url(url: &str, retained: usize) -> Result<Self, CheckpointError> {
        Ok(Self::new(StorageProvider::for_url(url).await?, retained))
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }

    /// Ids of all stored checkpoints, oldest first.
    pub async fn list(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut ids: Vec<u64> = self
            .storage
            .list(None)
            .await?
            .iter()
            .filter(|path| path.parts().count() == 1)
            .filter_map(parse_checkpoint_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn next_checkpoint_id(&self) -> Result<u64, CheckpointError> {
        Ok(self.list().await?.last().map_or(1, |id| id + 1))
    }

    /// Writes `checkpoint` and, once it is durable, deletes checkpoints beyond the retention
    /// limit.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let start = Instant::now();
        let bytes = encode_checkpoint(checkpoint)?;
        let size = bytes.len();

        self.storage
            .put(checkpoint_path(checkpoint.checkpoint_id), bytes)
            .await?;

        info!(
            message = "wrote checkpoint",
            checkpoint_id = checkpoint.checkpoint_id,
            partitions = checkpoint.partitions.len(),
            bytes = size,
            duration_ms = start.elapsed().as_millis() as u64
        );

        self.gc().await
    }

    pub async fn load(&self, id: u64) -> Result<Checkpoint, CheckpointError> {
        let bytes = self.storage.get(checkpoint_path(id)).await?;
        decode_checkpoint(id, &bytes)
    }

    /// Loads the newest checkpoint that passes validation, falling back to older ones when the
    /// newest is corrupt. Returns `None` when no checkpoint has been written yet.
    pub async fn load_latest_valid(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let ids = self.list().await?;

        for id in ids.iter().rev() {
            let bytes = match self.storage.get_if_present(checkpoint_path(*id)).await? {
                Some(bytes) => bytes,
                None => {
                    warn!(message = "checkpoint disappeared while loading", checkpoint_id = id);
                    continue;
                }
            };

            match decode_checkpoint(*id, &bytes) {
                Ok(checkpoint) => {
                    info!(message = "loaded checkpoint", checkpoint_id = id);
                    return Ok(Some(checkpoint));
                }
                Err(e) => {
                    warn!(message = "skipping invalid checkpoint", checkpoint_id = id, error = %e);
                }
            }
        }

        if ids.is_empty() {
            Ok(None)
        } else {
            Err(CheckpointError::NoValidCheckpoint { count: ids.len() })
        }
    }

    async fn gc(&self) -> Result<(), CheckpointError> {
        let ids = self.list().await?;
        if ids.len() <= self.retained {
            return Ok(());
        }

        for id in &ids[..ids.len() - self.retained] {
            debug!(message = "deleting superseded checkpoint", checkpoint_id = id);
            self.storage.delete_if_present(checkpoint_path(*id)).await?;
        }

        Ok(())
    }
}
