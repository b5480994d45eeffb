use brook_types::{Offset, PartitionId};

/// Tracks the highest offset of a feed partition whose effects are fully reflected in window
/// state. Offsets at or below the cursor have already been processed and are skipped when the
/// feed redelivers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCursor {
    partition: PartitionId,
    last: Option<Offset>,
}

impl OffsetCursor {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            last: None,
        }
    }

    pub fn restored(partition: PartitionId, last: Option<Offset>) -> Self {
        Self { partition, last }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn last(&self) -> Option<Offset> {
        self.last
    }

    /// The offset to resume reading the feed from.
    pub fn next_offset(&self) -> Offset {
        self.last.map_or(0, |o| o + 1)
    }

    pub fn is_processed(&self, offset: Offset) -> bool {
        self.last.is_some_and(|last| offset <= last)
    }

    /// Marks `offset` as processed. The cursor never moves backwards.
    pub fn advance(&mut self, offset: Offset) {
        self.last = Some(self.last.map_or(offset, |last| last.max(offset)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor() {
        let mut cursor = OffsetCursor::new(3);
        assert_eq!(cursor.next_offset(), 0);
        assert!(!cursor.is_processed(0));

        cursor.advance(0);
        cursor.advance(4);
        cursor.advance(2);

        assert_eq!(cursor.last(), Some(4));
        assert_eq!(cursor.next_offset(), 5);
        assert!(cursor.is_processed(4));
        assert!(cursor.is_processed(1));
        assert!(!cursor.is_processed(5));

        let restored = OffsetCursor::restored(3, cursor.last());
        assert_eq!(restored, cursor);
    }
}
