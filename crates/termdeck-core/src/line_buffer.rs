//! Bounded, thread-safe line buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity ring buffer of text lines.
///
/// Stores arrival-order lines (whatever split of the byte stream the producer
/// pushes), not visual lines. Once full, each pushed line evicts exactly the
/// single oldest line. All operations share one mutex, so any mix of
/// producers and consumers sees a consistent snapshot.
#[derive(Debug)]
pub struct LineBuffer {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LineBuffer {
    /// Create a buffer holding at most `capacity` lines. Capacity 0 is
    /// clamped to 1 so a push always lands somewhere.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let mut lines = self.inner.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn push_lines<I, S>(&self, new_lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lines = self.inner.lock().unwrap();
        for line in new_lines {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.into());
        }
    }

    /// All buffered lines in insertion order.
    pub fn all_lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// The `n` most recently pushed lines in chronological order, clipped to
    /// `min(n, len)`.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let lines = self.inner.lock().unwrap();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_push_and_read_in_order() {
        let buffer = LineBuffer::new(10);
        buffer.push_line("a");
        buffer.push_line("b");
        buffer.push_line("c");
        assert_eq!(buffer.all_lines(), vec!["a", "b", "c"]);
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let buffer = LineBuffer::new(3);
        buffer.push_lines(["1", "2", "3", "4", "5"]);
        assert_eq!(buffer.all_lines(), vec!["3", "4", "5"]);
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), buffer.capacity());
    }

    #[test]
    fn test_last_lines_clipping() {
        let buffer = LineBuffer::new(10);
        buffer.push_lines(["a", "b", "c"]);
        assert_eq!(buffer.last_lines(2), vec!["b", "c"]);
        // n >= len returns everything in order.
        assert_eq!(buffer.last_lines(3), vec!["a", "b", "c"]);
        assert_eq!(buffer.last_lines(100), vec!["a", "b", "c"]);
        assert!(buffer.last_lines(0).is_empty());
    }

    #[test]
    fn test_clear() {
        let buffer = LineBuffer::new(4);
        buffer.push_lines(["x", "y"]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.all_lines().is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buffer = LineBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push_line("only");
        buffer.push_line("latest");
        assert_eq!(buffer.all_lines(), vec!["latest"]);
    }

    #[test]
    fn test_concurrent_producers() {
        let buffer = Arc::new(LineBuffer::new(1000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let buf = buffer.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    buf.push_line(format!("{}-{}", t, i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.len(), 400);
    }

    proptest! {
        /// For any capacity and any longer push sequence, the buffer holds
        /// exactly the last `capacity` lines in push order.
        #[test]
        fn prop_eviction_keeps_last_n(capacity in 1usize..64, total in 1usize..256) {
            let buffer = LineBuffer::new(capacity);
            let pushed: Vec<String> = (0..total).map(|i| i.to_string()).collect();
            for line in &pushed {
                buffer.push_line(line.clone());
            }

            let expected: Vec<String> = pushed
                .iter()
                .skip(total.saturating_sub(capacity))
                .cloned()
                .collect();
            prop_assert_eq!(buffer.all_lines(), expected);
            prop_assert!(buffer.len() <= buffer.capacity());
        }

        #[test]
        fn prop_last_lines_is_suffix(capacity in 1usize..64, total in 1usize..256, n in 0usize..300) {
            let buffer = LineBuffer::new(capacity);
            for i in 0..total {
                buffer.push_line(i.to_string());
            }
            let all = buffer.all_lines();
            let last = buffer.last_lines(n);
            prop_assert_eq!(last.len(), n.min(all.len()));
            prop_assert_eq!(&all[all.len() - last.len()..], last.as_slice());
        }
    }
}
