//! Suspension store trait definition.

use chrono::{DateTime, Utc};
use stepchain_types::error::RepositoryError;
use stepchain_types::execution::{StoredSuspension, SuspensionRecord};
use uuid::Uuid;

/// Durable storage for suspension records, keyed by execution id.
///
/// Every operation is atomic for a single key. At most one unconsumed record
/// exists per execution id at any time.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SuspensionStore: Send + Sync {
    /// Write a new record.
    ///
    /// Fails with `RepositoryError::Conflict` when an unconsumed record already
    /// exists for the execution id. A consumed record is replaced.
    fn save(
        &self,
        record: &SuspensionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically mark the record consumed and return it.
    ///
    /// `NotFound` if no record exists, `Consumed` if another caller won.
    fn load_and_consume(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<SuspensionRecord, RepositoryError>> + Send;

    /// Read a record and its consumption marker without changing it.
    fn peek(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredSuspension>, RepositoryError>> + Send;

    /// Remove a record regardless of state. Returns `true` if it existed.
    fn delete(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Unconsumed records whose `wake_at` is at or before `now`, oldest first.
    fn list_due(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<SuspensionRecord>, RepositoryError>> + Send;
}
