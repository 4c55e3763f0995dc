//! In-memory transaction table
//!
//! Maps a transaction's start timestamp to its outcome. An outcome is written
//! once; a second write for the same start timestamp fails so a late commit can
//! never overwrite an abort (or vice versa).

use dashmap::DashMap;

use tsweep_core::{CommitStatus, Error, Result, TableRef, TransactionService};

/// Name reported in errors for the transaction table
const TRANSACTIONS_TABLE: &str = "_transactions";

/// Transaction table backed by a DashMap
#[derive(Debug, Default)]
pub struct InMemoryTransactionService {
    outcomes: DashMap<i64, CommitStatus>,
}

impl InMemoryTransactionService {
    /// Create an empty transaction table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `start_ts` committed at `commit_ts`
    pub fn commit(&self, start_ts: i64, commit_ts: i64) -> Result<()> {
        self.put_unless_exists(start_ts, CommitStatus::Committed(commit_ts))
    }

    /// Record that `start_ts` rolled back
    pub fn abort(&self, start_ts: i64) -> Result<()> {
        self.put_unless_exists(start_ts, CommitStatus::Aborted)
    }

    /// Number of recorded outcomes
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no outcome is recorded
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl TransactionService for InMemoryTransactionService {
    fn get(&self, start_ts: i64) -> Result<Option<CommitStatus>> {
        Ok(self.outcomes.get(&start_ts).map(|entry| *entry.value()))
    }

    fn put_unless_exists(&self, start_ts: i64, status: CommitStatus) -> Result<()> {
        match self.outcomes.entry(start_ts) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::KeyAlreadyExists {
                table: TableRef::new(TRANSACTIONS_TABLE),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(status);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_start_ts_is_none() {
        let txns = InMemoryTransactionService::new();
        assert_eq!(txns.get(42).unwrap(), None);
        assert!(txns.is_empty());
    }

    #[test]
    fn test_outcome_written_once() {
        let txns = InMemoryTransactionService::new();
        txns.commit(10, 15).unwrap();
        assert!(matches!(txns.abort(10), Err(Error::KeyAlreadyExists { .. })));
        assert_eq!(txns.get(10).unwrap(), Some(CommitStatus::Committed(15)));
    }

    #[test]
    fn test_get_many_omits_in_flight() {
        let txns = InMemoryTransactionService::new();
        txns.commit(1, 2).unwrap();
        txns.abort(3).unwrap();

        let outcomes = txns.get_many(&[1, 2, 3].into_iter().collect()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[&3], CommitStatus::Aborted);
        assert!(!outcomes.contains_key(&2));
    }
}
