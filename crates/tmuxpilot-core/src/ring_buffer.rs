use std::collections::VecDeque;

/// Fixed-capacity, append-only sequence of lines.
///
/// Pushing past capacity silently evicts the oldest line. One instance is
/// owned per live session by the supervisor and destroyed when the session
/// leaves the in-memory registry.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

/// Default capacity used when a session does not override it.
pub const DEFAULT_CAPACITY: usize = 10_000;

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Push one line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Push many lines in order.
    pub fn push_all<I: IntoIterator<Item = S>, S: Into<String>>(&mut self, lines: I) {
        for line in lines {
            self.push(line);
        }
    }

    /// The last `k` lines, oldest first.
    pub fn last_n(&self, k: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(k);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_and_last_n() {
        let mut rb = RingBuffer::new(5);
        for i in 0..3 {
            rb.push(format!("line{i}"));
        }
        assert_eq!(rb.last_n(10), vec!["line0", "line1", "line2"]);
        assert_eq!(rb.last_n(2), vec!["line1", "line2"]);
    }

    #[test]
    fn eviction_at_capacity() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(format!("line{i}"));
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.last_n(10), vec!["line2", "line3", "line4"]);
    }

    #[test]
    fn push_one_more_evicts_exactly_oldest() {
        let mut rb = RingBuffer::new(3);
        rb.push("a");
        rb.push("b");
        rb.push("c");
        assert_eq!(rb.last_n(10), vec!["a", "b", "c"]);
        rb.push("d");
        assert_eq!(rb.last_n(10), vec!["b", "c", "d"]);
    }

    #[test]
    fn empty_buffer() {
        let rb = RingBuffer::new(10);
        assert!(rb.is_empty());
        assert_eq!(rb.last_n(5), Vec::<String>::new());
    }

    #[test]
    fn zero_capacity_clamped_to_one() {
        let mut rb = RingBuffer::new(0);
        rb.push("a");
        rb.push("b");
        assert_eq!(rb.capacity(), 1);
        assert_eq!(rb.last_n(10), vec!["b"]);
    }

    #[test]
    fn default_capacity_matches_constant() {
        let rb = RingBuffer::default();
        assert_eq!(rb.capacity(), DEFAULT_CAPACITY);
    }

    proptest! {
        /// After pushing any sequence of lines, the buffer never holds more
        /// than its capacity, and whatever it does hold is exactly the tail
        /// of the pushed sequence.
        #[test]
        fn never_exceeds_capacity_and_retains_the_tail(
            capacity in 1usize..20,
            lines in proptest::collection::vec("[a-z]{1,6}", 0..50),
        ) {
            let mut rb = RingBuffer::new(capacity);
            for line in &lines {
                rb.push(line.clone());
            }
            prop_assert!(rb.len() <= capacity);
            let expected_tail_len = lines.len().min(capacity);
            let expected: Vec<String> = lines[lines.len() - expected_tail_len..].to_vec();
            prop_assert_eq!(rb.last_n(capacity), expected);
        }
    }
}
