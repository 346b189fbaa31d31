//! Append-only offset buffer backing the event and log streams.
//!
//! Clients read incrementally with [`OffsetBuffer::since`]: pass the cursor
//! returned by the previous call and receive everything appended in between
//! plus the new cursor. Reads are non-destructive, so any number of clients
//! can tail the same buffer at their own pace.

/// An append-only in-memory sequence with cursor-based incremental reads.
#[derive(Debug, Default)]
pub struct OffsetBuffer<T> {
    items: Vec<T>,
}

impl<T: Clone> OffsetBuffer<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append one item to the end of the sequence.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Return every item appended at or after `offset`, plus the cursor to
    /// resume from. An out-of-range offset clamps to the end (empty slice,
    /// cursor unchanged) rather than erroring.
    pub fn since(&self, offset: usize) -> (Vec<T>, usize) {
        let start = offset.min(self.items.len());
        (self.items[start..].to_vec(), self.items.len())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_zero_returns_everything() {
        let mut buf = OffsetBuffer::new();
        buf.push("a");
        buf.push("b");
        let (items, next) = buf.since(0);
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(next, 2);
    }

    #[test]
    fn resuming_from_next_offset_never_duplicates_or_skips() {
        let mut buf = OffsetBuffer::new();
        buf.push(1);
        buf.push(2);
        let (first, cursor) = buf.since(0);
        assert_eq!(first, vec![1, 2]);

        buf.push(3);
        let (second, cursor2) = buf.since(cursor);
        assert_eq!(second, vec![3]);
        assert_eq!(cursor2, 3);

        // Nothing new: empty slice, cursor stable.
        let (third, cursor3) = buf.since(cursor2);
        assert!(third.is_empty());
        assert_eq!(cursor3, cursor2);
    }

    #[test]
    fn out_of_range_offset_clamps() {
        let mut buf = OffsetBuffer::new();
        buf.push("x");
        let (items, next) = buf.since(999);
        assert!(items.is_empty());
        assert_eq!(next, 1);
    }

    #[test]
    fn reads_are_shared_and_non_destructive() {
        let mut buf = OffsetBuffer::new();
        buf.push("a");
        buf.push("b");
        let (one, n1) = buf.since(0);
        let (two, n2) = buf.since(0);
        assert_eq!(one, two);
        assert_eq!(n1, n2);
    }
}
