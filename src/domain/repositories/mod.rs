use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::models::{OutboxMessage, OutboxStats, SemaphoreOwners, VersionedSemaphoreOwners};

/// A claimed row whose payload could not be hydrated.
#[derive(Debug, Clone)]
pub struct FaultedClaim {
    pub id: Uuid,
    pub try_count: i32,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub reason: String,
}

/// Rows flipped to `InProgress` by a single claim.
#[derive(Debug, Default)]
pub struct ClaimedBatch {
    pub messages: Vec<OutboxMessage>,
    pub faulted: Vec<FaultedClaim>,
}

impl ClaimedBatch {
    pub fn len(&self) -> usize {
        self.messages.len() + self.faulted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.faulted.is_empty()
    }
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Atomically moves up to `batch_size` due `Ready` rows to `InProgress`,
    /// oldest `priority_date_utc` first, incrementing their `try_count`.
    /// Concurrent callers never receive the same row.
    async fn claim_batch(&self, batch_size: u32, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch>;

    /// Same transition as [`claim_batch`](Self::claim_batch), restricted to one row.
    async fn claim_by_id(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch>;

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn mark_ready(&self, id: Uuid, priority_date_utc: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn mark_failed(&self, id: Uuid) -> anyhow::Result<bool>;

    /// `InProgress` rows with `priority_date_utc <= older_than` go back to `Ready`.
    async fn reset_stale(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Deletes `Processed` rows with `priority_date_utc <= older_than`.
    async fn delete_processed(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Moves a `Failed` row back to `Ready`, due at `now`, with a fresh try budget.
    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OutboxMessage>>;

    async fn stats(&self) -> anyhow::Result<OutboxStats>;
}

/// The caller's open transaction, seen from the outbox.
///
/// Appending never commits: the row becomes visible when the caller commits
/// its own work.
#[async_trait]
pub trait OutboxUnitOfWork: Send {
    async fn append(&mut self, message: &OutboxMessage) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SemaphoreRepository: Send + Sync {
    /// Reads the semaphore row, inserting an empty one first if absent.
    async fn load_or_create(&self, name: &str) -> anyhow::Result<VersionedSemaphoreOwners>;

    /// Replaces the value only if the stored token still equals `expected_token`.
    /// Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_token: Uuid,
        owners: &SemaphoreOwners,
    ) -> anyhow::Result<bool>;
}
