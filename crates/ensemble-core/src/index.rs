//! Outbound event numbering.
//!
//! Every message the evaluator sends to observers (snapshot, update,
//! terminated) consumes exactly one index, so an observer can tell from the
//! `id` field whether it saw every broadcast since it connected.

/// Strictly increasing counter for outbound envelopes.
///
/// Starts at 1; index 0 is reserved for the implicit initial snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIndex {
    next: u64,
}

impl EventIndex {
    /// A fresh counter whose first index is 1.
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Return the current index and advance.
    #[allow(clippy::should_implement_trait)]
    pub const fn next(&mut self) -> u64 {
        let index = self.next;
        self.next = self.next.saturating_add(1);
        index
    }
}

impl Default for EventIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_increments() {
        let mut index = EventIndex::new();
        assert_eq!(index.next(), 1);
        assert_eq!(index.next(), 2);
        assert_eq!(index.next(), 3);
    }

    #[test]
    fn indices_are_strictly_increasing() {
        let mut index = EventIndex::default();
        let issued: Vec<u64> = (0..100).map(|_| index.next()).collect();
        assert!(issued.windows(2).all(|pair| matches!(pair, [a, b] if a < b)));
    }
}
