use std::ops::RangeInclusive;

/// Tracks which log indexes have been persisted and which have been exported.
///
/// `first_unconsumed <= last_persisted + 1` always holds. The cursor lives in
/// memory only; after a restart it is rebuilt from the log with
/// [`IndexCursor::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCursor {
    first_unconsumed: u64,
    last_persisted: u64,
}

impl IndexCursor {
    /// Rebuild the cursor from the log's own bounds. Everything still in the
    /// log is treated as not yet exported.
    pub fn reconcile(first_index: u64, last_index: u64) -> Self {
        Self {
            first_unconsumed: first_index.min(last_index + 1),
            last_persisted: last_index,
        }
    }

    pub fn first_unconsumed(&self) -> u64 {
        self.first_unconsumed
    }

    pub fn last_persisted(&self) -> u64 {
        self.last_persisted
    }

    /// Record the log's current last index.
    pub fn observe(&mut self, last_index: u64) {
        self.last_persisted = self.last_persisted.max(last_index);
    }

    /// Indexes persisted but not yet exported, if any.
    pub fn pending(&self) -> Option<RangeInclusive<u64>> {
        (self.first_unconsumed <= self.last_persisted)
            .then_some(self.first_unconsumed..=self.last_persisted)
    }

    /// Mark everything up to and including `last_exported` as exported.
    ///
    /// Never moves backwards and never past what has been observed as
    /// persisted.
    pub fn advance_past(&mut self, last_exported: u64) {
        let next = last_exported.min(self.last_persisted) + 1;
        self.first_unconsumed = self.first_unconsumed.max(next);
    }
}
