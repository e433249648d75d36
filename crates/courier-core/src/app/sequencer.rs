//! ReleaseBuffer - 順序どおりの完了通知
//!
//! 送信は並行して終わりますが、カウンタ更新と analytics 記録は
//! ソース順（シーケンス番号順）でしか出してはいけません。
//! 先に終わった完了はここで待たせ、欠番が埋まった時点でまとめて放出します。

use std::collections::BTreeMap;

/// Holds out-of-order completions until every earlier sequence number is in.
#[derive(Debug)]
pub struct ReleaseBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReleaseBuffer<T> {
    /// `start` is the first sequence number that will be released.
    pub fn new(start: u64) -> Self {
        Self {
            next: start,
            pending: BTreeMap::new(),
        }
    }

    /// Next sequence number waiting to be released.
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Insert a completion and return everything now releasable, in order.
    ///
    /// Sequence numbers below `next_seq()` were already released and are ignored.
    pub fn complete(&mut self, seq: u64, item: T) -> Vec<(u64, T)> {
        if seq < self.next {
            return Vec::new();
        }
        self.pending.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push((self.next, item));
            self.next += 1;
        }
        ready
    }

    /// Everything still held, in sequence order. Used on cancellation.
    pub fn drain(&mut self) -> Vec<(u64, T)> {
        let drained: Vec<(u64, T)> = std::mem::take(&mut self.pending).into_iter().collect();
        if let Some((last, _)) = drained.last() {
            self.next = self.next.max(last + 1);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_completions_release_immediately() {
        let mut buf = ReleaseBuffer::new(0);
        assert_eq!(buf.complete(0, "a"), vec![(0, "a")]);
        assert_eq!(buf.complete(1, "b"), vec![(1, "b")]);
        assert_eq!(buf.next_seq(), 2);
    }

    #[test]
    fn later_completion_waits_for_the_gap() {
        let mut buf = ReleaseBuffer::new(10);
        assert!(buf.complete(12, "c").is_empty());
        assert!(buf.complete(11, "b").is_empty());
        assert_eq!(buf.pending_len(), 2);

        let released = buf.complete(10, "a");
        assert_eq!(released, vec![(10, "a"), (11, "b"), (12, "c")]);
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.next_seq(), 13);
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let mut buf = ReleaseBuffer::new(5);
        assert!(buf.complete(3, "old").is_empty());
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn drain_returns_held_items_in_order() {
        let mut buf = ReleaseBuffer::new(0);
        buf.complete(3, "d");
        buf.complete(1, "b");
        assert_eq!(buf.drain(), vec![(1, "b"), (3, "d")]);
        assert_eq!(buf.next_seq(), 4);
        assert_eq!(buf.pending_len(), 0);
    }
}
