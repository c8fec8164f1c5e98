use std::sync::{Mutex, MutexGuard, PoisonError};

use shared::domain::CommitRecord;

/// Append-only log of the mutations proposed within one dispatch chain.
#[derive(Debug, Default)]
pub(crate) struct CommitTracker {
    records: Mutex<Vec<CommitRecord>>,
}

impl CommitTracker {
    fn lock(&self) -> MutexGuard<'_, Vec<CommitRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, record: CommitRecord) {
        self.lock().push(record);
    }

    /// Records appended so far, in append order.
    pub(crate) fn snapshot(&self) -> Vec<CommitRecord> {
        self.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
