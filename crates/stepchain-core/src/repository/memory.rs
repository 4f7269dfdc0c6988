//! In-process suspension store backed by `DashMap`.
//!
//! Suitable for tests and single-process deployments where suspended
//! executions do not need to survive a restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepchain_types::error::RepositoryError;
use stepchain_types::execution::{StoredSuspension, SuspensionRecord};
use uuid::Uuid;

use super::suspension::SuspensionStore;

#[derive(Debug, Default)]
pub struct InMemorySuspensionStore {
    records: DashMap<Uuid, StoredSuspension>,
}

impl InMemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, consumed or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SuspensionStore for InMemorySuspensionStore {
    async fn save(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        match self.records.entry(record.execution_id) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_consumed() {
                    return Err(RepositoryError::Conflict(format!(
                        "execution {} already has an unconsumed suspension",
                        record.execution_id
                    )));
                }
                existing.insert(StoredSuspension {
                    record: record.clone(),
                    consumed_at: None,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredSuspension {
                    record: record.clone(),
                    consumed_at: None,
                });
            }
        }
        Ok(())
    }

    async fn load_and_consume(&self, execution_id: &Uuid) -> Result<SuspensionRecord, RepositoryError> {
        // get_mut holds the shard write lock, so check-and-mark is atomic.
        let mut stored = self
            .records
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.is_consumed() {
            return Err(RepositoryError::Consumed);
        }
        stored.consumed_at = Some(Utc::now());
        Ok(stored.record.clone())
    }

    async fn peek(&self, execution_id: &Uuid) -> Result<Option<StoredSuspension>, RepositoryError> {
        Ok(self.records.get(execution_id).map(|r| r.value().clone()))
    }

    async fn delete(&self, execution_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.remove(execution_id).is_some())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        let mut due: Vec<SuspensionRecord> = self
            .records
            .iter()
            .filter(|r| !r.is_consumed())
            .filter(|r| r.record.wake_at.is_some_and(|at| at <= now))
            .map(|r| r.record.clone())
            .collect();
        due.sort_by_key(|r| r.wake_at);
        Ok(due)
    }
}
