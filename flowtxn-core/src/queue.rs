//! Bounded FIFO for messages awaiting correlation.
//!
//! Protocols that pipeline requests (HTTP/1.1, Redis, PostgreSQL
//! multi-statement queries) can have several requests outstanding before the first response
//! arrives. The queue holds them in arrival order while enforcing two
//! independent ceilings:
//!
//! - a message-count ceiling: at the limit, the oldest entry is evicted
//!   before the new one is admitted;
//! - a byte ceiling: oldest entries are evicted until the new entry fits.
//!
//! A ceiling of 0 disables that dimension. An entry larger than the byte
//! ceiling on its own empties the queue and is then admitted alone.

use std::collections::VecDeque;

/// Count and byte ceilings for a [`BoundedMessageQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum number of queued entries (0 = unbounded).
    pub max_count: usize,
    /// Maximum summed entry size in bytes (0 = unbounded).
    pub max_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_count: 1000,
            max_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl QueueLimits {
    /// No ceiling in either dimension.
    pub const UNBOUNDED: QueueLimits = QueueLimits {
        max_count: 0,
        max_bytes: 0,
    };
}

/// Ordered list of entries bounded by total bytes and total count.
#[derive(Debug)]
pub struct BoundedMessageQueue<T> {
    entries: VecDeque<(T, usize)>,
    total_bytes: usize,
    limits: QueueLimits,
}

impl<T> BoundedMessageQueue<T> {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            limits,
        }
    }

    /// Append an entry of `size` bytes, evicting from the head as needed.
    ///
    /// Returns the number of entries evicted.
    pub fn append(&mut self, item: T, size: usize) -> usize {
        let mut evicted = 0;

        if self.limits.max_count > 0 && self.entries.len() >= self.limits.max_count {
            self.evict_head();
            evicted += 1;
        }

        if self.limits.max_bytes > 0 {
            while !self.entries.is_empty()
                && self.total_bytes.saturating_add(size) > self.limits.max_bytes
            {
                self.evict_head();
                evicted += 1;
            }
        }

        self.total_bytes += size;
        self.entries.push_back((item, size));
        evicted
    }

    /// Remove and return the oldest entry.
    pub fn pop(&mut self) -> Option<T> {
        let (item, size) = self.entries.pop_front()?;
        self.total_bytes -= size;
        Some(item)
    }

    /// Peek at the oldest entry.
    pub fn front(&self) -> Option<&T> {
        self.entries.front().map(|(item, _)| item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed size of all queued entries.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.total_bytes = 0;
        self.entries.drain(..).map(|(item, _)| item)
    }

    /// Iterate entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(item, _)| item)
    }

    fn evict_head(&mut self) {
        if let Some((_, size)) = self.entries.pop_front() {
            self.total_bytes -= size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(limits: QueueLimits, sizes: &[usize]) -> BoundedMessageQueue<usize> {
        let mut q = BoundedMessageQueue::new(limits);
        for &s in sizes {
            q.append(s, s);
        }
        q
    }

    fn contents(q: &BoundedMessageQueue<usize>) -> Vec<usize> {
        q.iter().copied().collect()
    }

    #[test]
    fn test_count_ceiling_evicts_oldest() {
        let q = fill(
            QueueLimits {
                max_count: 3,
                max_bytes: 0,
            },
            &[1, 2, 3, 4, 5],
        );
        assert_eq!(contents(&q), vec![3, 4, 5]);
        assert_eq!(q.total_bytes(), 12);
    }

    #[test]
    fn test_byte_ceiling_evicts_until_fit() {
        let q = fill(
            QueueLimits {
                max_count: 0,
                max_bytes: 10,
            },
            &[1, 2, 3, 4, 5],
        );
        assert_eq!(contents(&q), vec![4, 5]);
        assert!(q.total_bytes() <= 10);
    }

    #[test]
    fn test_oversized_entry_admitted_alone() {
        let mut q = fill(
            QueueLimits {
                max_count: 0,
                max_bytes: 10,
            },
            &[2, 3],
        );
        let evicted = q.append(20, 20);
        assert_eq!(evicted, 2);
        assert_eq!(contents(&q), vec![20]);

        let q = fill(
            QueueLimits {
                max_count: 0,
                max_bytes: 10,
            },
            &[11],
        );
        assert_eq!(contents(&q), vec![11]);
    }

    #[test]
    fn test_unbounded() {
        let q = fill(QueueLimits::UNBOUNDED, &[100, 200, 300, 400]);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut q = fill(QueueLimits::default(), &[1, 2, 3]);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.total_bytes(), 3);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
        assert_eq!(q.total_bytes(), 0);
    }

    #[test]
    fn test_drain_resets_bytes() {
        let mut q = fill(QueueLimits::default(), &[5, 6]);
        let drained: Vec<_> = q.drain().collect();
        assert_eq!(drained, vec![5, 6]);
        assert_eq!(q.total_bytes(), 0);
        assert!(q.is_empty());
    }
}
