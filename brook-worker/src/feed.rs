use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use brook_types::{ActivityRecord, Offset, PartitionId};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub offset: Offset,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub entries: Vec<FeedEntry>,
    /// Set when the partition is exhausted and no further entries will become available.
    pub end_of_data: bool,
}

/// A partitioned, replayable log of serialized records. Reading from an offset returns the
/// entries at and after it, in offset order; entries before the requested offset may be
/// delivered again.
#[async_trait]
pub trait Feed: Send + Sync {
    fn partitions(&self) -> Vec<PartitionId>;

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> anyhow::Result<FeedBatch>;
}

#[derive(Default)]
struct MemoryPartition {
    entries: Vec<Bytes>,
    sealed: bool,
}

/// An in-process feed. Partitions accept appends until sealed.
#[derive(Clone)]
pub struct MemoryFeed {
    partitions: Arc<Vec<Mutex<MemoryPartition>>>,
    redelivery: Arc<Mutex<u64>>,
}

impl MemoryFeed {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: Arc::new(
                (0..partitions)
                    .map(|_| Mutex::new(MemoryPartition::default()))
                    .collect(),
            ),
            redelivery: Arc::new(Mutex::new(0)),
        }
    }

    fn partition(&self, partition: PartitionId) -> anyhow::Result<&Mutex<MemoryPartition>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| anyhow!("no such partition {}", partition))
    }

    /// Appends a payload, returning its offset.
    pub fn append(
        &self,
        partition: PartitionId,
        payload: impl Into<Bytes>,
    ) -> anyhow::Result<Offset> {
        let mut p = self.partition(partition)?.lock().unwrap();
        if p.sealed {
            bail!("partition {} is sealed", partition);
        }
        p.entries.push(payload.into());
        Ok(p.entries.len() as Offset - 1)
    }

    pub fn append_record(
        &self,
        partition: PartitionId,
        record: &ActivityRecord,
    ) -> anyhow::Result<Offset> {
        self.append(partition, record.to_json())
    }

    /// Marks the end of a partition.
    pub fn seal(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.partition(partition)?.lock().unwrap().sealed = true;
        Ok(())
    }

    pub fn seal_all(&self) {
        for p in self.partitions.iter() {
            p.lock().unwrap().sealed = true;
        }
    }

    /// Every read starts up to `count` offsets before the requested one, as an at-least-once
    /// transport does after a reconnect.
    pub fn set_redelivery(&self, count: u64) {
        *self.redelivery.lock().unwrap() = count;
    }

    pub fn len(&self, partition: PartitionId) -> usize {
        self.partition(partition)
            .map(|p| p.lock().unwrap().entries.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    fn partitions(&self) -> Vec<PartitionId> {
        (0..self.partitions.len() as PartitionId).collect()
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> anyhow::Result<FeedBatch> {
        let redelivery = *self.redelivery.lock().unwrap();
        let p = self.partition(partition)?.lock().unwrap();

        let len = p.entries.len() as Offset;
        let start = from.saturating_sub(redelivery).min(len);
        let end = from.saturating_add(max as Offset).min(len);

        Ok(FeedBatch {
            entries: (start..end)
                .map(|offset| FeedEntry {
                    offset,
                    payload: p.entries[offset as usize].clone(),
                })
                .collect(),
            end_of_data: p.sealed && end == len,
        })
    }
}

// position of the first unread line of a partition file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FilePosition {
    line: Offset,
    byte: u64,
}

/// A directory of `partition-<n>.jsonl` files, one JSON document per line. The offset of a
/// record is its zero-based line number; a trailing line without a newline is not yet complete
/// and is not delivered.
pub struct FileFeed {
    files: BTreeMap<PartitionId, PathBuf>,
    positions: Mutex<BTreeMap<PartitionId, FilePosition>>,
}

impl FileFeed {
    /// Opens every partition file in `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut files = BTreeMap::new();

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to read feed directory {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(partition) = name
                .to_str()
                .and_then(|n| n.strip_prefix("partition-"))
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<PartitionId>().ok())
            else {
                continue;
            };
            files.insert(partition, entry.path());
        }

        if files.is_empty() {
            bail!("no partition files found in {}", dir.display());
        }

        info!(
            message = "opened file feed",
            dir = %dir.display(),
            partitions = files.len()
        );

        Ok(Self {
            files,
            positions: Mutex::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl Feed for FileFeed {
    fn partitions(&self) -> Vec<PartitionId> {
        self.files.keys().copied().collect()
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> anyhow::Result<FeedBatch> {
        let path = self
            .files
            .get(&partition)
            .ok_or_else(|| anyhow!("no such partition {}", partition))?;

        // resume from the remembered position when reading sequentially, otherwise rescan
        let position = self
            .positions
            .lock()
            .unwrap()
            .get(&partition)
            .copied()
            .filter(|p| p.line <= from)
            .unwrap_or(FilePosition { line: 0, byte: 0 });

        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(position.byte)).await?;
        let mut reader = BufReader::new(file);

        let mut entries = vec![];
        let mut line = position.line;
        let mut byte = position.byte;
        let mut end_of_data = false;
        let mut buf = vec![];

        while entries.len() < max {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await?;
            if read == 0 {
                end_of_data = true;
                break;
            }
            if buf.last() != Some(&b'\n') {
                // partial trailing line; picked up again once it is complete
                break;
            }

            if line >= from {
                entries.push(FeedEntry {
                    offset: line,
                    payload: Bytes::copy_from_slice(&buf[..buf.len() - 1]),
                });
            }

            line += 1;
            byte += read as u64;
        }

        if entries.len() == max {
            end_of_data = reader.fill_buf().await?.is_empty();
        }

        self.positions
            .lock()
            .unwrap()
            .insert(partition, FilePosition { line, byte });

        Ok(FeedBatch {
            entries,
            end_of_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_types::{from_millis, EventType};

    #[tokio::test]
    async fn test_memory_feed() {
        let feed = MemoryFeed::new(2);
        for i in 0..5 {
            feed.append(0, format!("{}", i)).unwrap();
        }

        let batch = feed.read(0, 1, 3).await.unwrap();
        assert_eq!(
            batch.entries.iter().map(|e| e.offset).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(batch.entries[0].payload, Bytes::from("1"));
        assert!(!batch.end_of_data);

        assert!(!feed.read(0, 5, 10).await.unwrap().end_of_data);
        feed.seal(0).unwrap();
        let batch = feed.read(0, 4, 10).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.end_of_data);

        assert!(feed.append(0, "x").is_err());
        assert!(feed.read(1, 0, 10).await.unwrap().entries.is_empty());
        assert!(feed.read(2, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_feed_redelivery() {
        let feed = MemoryFeed::new(1);
        for i in 0..5 {
            feed.append(0, format!("{}", i)).unwrap();
        }
        feed.set_redelivery(2);

        let batch = feed.read(0, 3, 1).await.unwrap();
        assert_eq!(
            batch.entries.iter().map(|e| e.offset).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_file_feed() {
        let dir = tempfile::tempdir().unwrap();
        let record =
            ActivityRecord::new("a", "s", from_millis(1_000), EventType::PageView).unwrap();
        let mut contents = vec![];
        for _ in 0..3 {
            contents.extend(record.to_json());
            contents.push(b'\n');
        }
        // incomplete line
        contents.extend(b"{\"userId\"");
        tokio::fs::write(dir.path().join("partition-0.jsonl"), &contents)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("partition-1.jsonl"), b"")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("README"), b"ignored")
            .await
            .unwrap();

        let feed = FileFeed::open(dir.path()).await.unwrap();
        assert_eq!(feed.partitions(), vec![0, 1]);

        let batch = feed.read(0, 0, 2).await.unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert!(!batch.end_of_data);
        assert_eq!(
            ActivityRecord::from_json(&batch.entries[1].payload).unwrap(),
            record
        );

        let batch = feed.read(0, 2, 10).await.unwrap();
        assert_eq!(
            batch.entries.iter().map(|e| e.offset).collect::<Vec<_>>(),
            vec![2]
        );
        assert!(!batch.end_of_data);

        // completing the last line makes it visible, and the partition is then exhausted
        let mut file = contents.clone();
        file.extend(b": \"b\"}\n");
        tokio::fs::write(dir.path().join("partition-0.jsonl"), &file)
            .await
            .unwrap();
        let batch = feed.read(0, 3, 10).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].offset, 3);
        assert!(batch.end_of_data);

        // rereading from the start rescans the file
        assert_eq!(feed.read(0, 0, 10).await.unwrap().entries.len(), 4);
        assert!(feed.read(1, 0, 10).await.unwrap().end_of_data);
    }

    #[tokio::test]
    async fn test_file_feed_reads_sequential_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut contents = vec![];
        for i in 0..100 {
            contents.extend(format!("{{\"n\": {:03}}}\n", i).into_bytes());
        }
        let line_len = contents.len() as u64 / 100;
        tokio::fs::write(dir.path().join("partition-0.jsonl"), &contents)
            .await
            .unwrap();

        let feed = FileFeed::open(dir.path()).await.unwrap();
        let mut offsets = vec![];
        let mut from = 0;
        loop {
            let batch = feed.read(0, from, 7).await.unwrap();
            offsets.extend(batch.entries.iter().map(|e| e.offset));
            from = offsets.last().map(|o| o + 1).unwrap_or(0);

            // each batch consumes exactly its own lines
            assert_eq!(
                feed.positions.lock().unwrap()[&0],
                FilePosition {
                    line: from,
                    byte: from * line_len
                }
            );

            if batch.end_of_data {
                break;
            }
        }

        assert_eq!(offsets, (0..100).collect::<Vec<_>>());
        assert_eq!(from, 100);
    }

    #[tokio::test]
    async fn test_file_feed_requires_partitions() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileFeed::open(dir.path()).await.is_err());
    }
}
