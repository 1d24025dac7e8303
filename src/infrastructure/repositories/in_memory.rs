use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::OutboxRecord;
use crate::domain::{
    models::{
        OutboxMessage, OutboxMessageStatus, OutboxStats, SemaphoreOwners, VersionedSemaphoreOwners,
    },
    repositories::{ClaimedBatch, OutboxRepository, OutboxUnitOfWork, SemaphoreRepository},
};

const READY: i16 = 0;
const IN_PROGRESS: i16 = 1;
const PROCESSED: i16 = 2;
const FAILED: i16 = 100;

/// Outbox table held in process memory.
///
/// Every operation takes the write lock for its whole read-modify-write, which
/// gives the same per-row exclusivity the SQL claim gets from row locks.
#[derive(Default, Clone)]
pub struct InMemoryOutboxRepository {
    rows: Arc<RwLock<HashMap<Uuid, OutboxRecord>>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a unit of work whose appends land only on [`InMemoryUnitOfWork::commit`].
    pub fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            rows: self.rows.clone(),
            pending: Vec::new(),
        }
    }

    /// Writes a message as-is, bypassing any unit of work.
    pub async fn insert(&self, message: &OutboxMessage) -> anyhow::Result<()> {
        let record = OutboxRecord::from_message(message)?;
        self.rows.write().await.insert(record.id, record);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn insert_record(&self, record: OutboxRecord) {
        self.rows.write().await.insert(record.id, record);
    }

    async fn set_status_if(&self, id: Uuid, expected: i16, status: i16) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.status == expected => {
                row.status = status;
                true
            }
            _ => false,
        }
    }
}

fn claim(row: &mut OutboxRecord, batch: &mut ClaimedBatch) {
    row.status = IN_PROGRESS;
    row.try_count += 1;
    match row.clone().hydrate() {
        Ok(message) => batch.messages.push(message),
        Err(fault) => batch.faulted.push(fault),
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn claim_batch(&self, batch_size: u32, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch> {
        let mut rows = self.rows.write().await;

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = rows
            .values()
            .filter(|row| row.status == READY && row.priority_date_utc <= now)
            .map(|row| (row.priority_date_utc, row.created_at_utc, row.id))
            .collect();
        due.sort();

        let mut batch = ClaimedBatch::default();
        for (_, _, id) in due.into_iter().take(batch_size as usize) {
            if let Some(row) = rows.get_mut(&id) {
                claim(row, &mut batch);
            }
        }
        Ok(batch)
    }

    async fn claim_by_id(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch> {
        let mut rows = self.rows.write().await;
        let mut batch = ClaimedBatch::default();
        if let Some(row) = rows.get_mut(&id) {
            if row.status == READY && row.priority_date_utc <= now {
                claim(row, &mut batch);
            }
        }
        Ok(batch)
    }

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.set_status_if(id, IN_PROGRESS, PROCESSED).await)
    }

    async fn mark_ready(&self, id: Uuid, priority_date_utc: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.status == IN_PROGRESS => {
                row.status = READY;
                row.priority_date_utc = priority_date_utc;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.set_status_if(id, IN_PROGRESS, FAILED).await)
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut rows = self.rows.write().await;
        let mut count = 0;
        for row in rows.values_mut() {
            if row.status == IN_PROGRESS && row.priority_date_utc <= older_than {
                row.status = READY;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_processed(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| !(row.status == PROCESSED && row.priority_date_utc <= older_than));
        Ok((before - rows.len()) as u64)
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.status == FAILED => {
                row.status = READY;
                row.try_count = 0;
                row.priority_date_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OutboxMessage>> {
        let rows = self.rows.read().await;
        rows.get(&id)
            .cloned()
            .map(|row| row.hydrate().map_err(|fault| anyhow::anyhow!(fault.reason)))
            .transpose()
    }

    async fn stats(&self) -> anyhow::Result<OutboxStats> {
        let rows = self.rows.read().await;
        let mut stats = OutboxStats::default();
        for row in rows.values() {
            match OutboxMessageStatus::from_i16(row.status) {
                Some(OutboxMessageStatus::Ready) => stats.ready += 1,
                Some(OutboxMessageStatus::InProgress) => stats.in_progress += 1,
                Some(OutboxMessageStatus::Processed) => stats.processed += 1,
                Some(OutboxMessageStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        Ok(stats)
    }
}

/// Buffered appends against an [`InMemoryOutboxRepository`].
pub struct InMemoryUnitOfWork {
    rows: Arc<RwLock<HashMap<Uuid, OutboxRecord>>>,
    pending: Vec<OutboxRecord>,
}

impl InMemoryUnitOfWork {
    pub async fn commit(self) {
        let mut rows = self.rows.write().await;
        for record in self.pending {
            rows.insert(record.id, record);
        }
    }

    pub fn rollback(self) {}

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl OutboxUnitOfWork for InMemoryUnitOfWork {
    async fn append(&mut self, message: &OutboxMessage) -> anyhow::Result<()> {
        self.pending.push(OutboxRecord::from_message(message)?);
        Ok(())
    }
}

struct SemaphoreRecord {
    owners: SemaphoreOwners,
    concurrency_token: Uuid,
}

#[derive(Default, Clone)]
pub struct InMemorySemaphoreRepository {
    semaphores: Arc<RwLock<HashMap<String, SemaphoreRecord>>>,
}

impl InMemorySemaphoreRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SemaphoreRepository for InMemorySemaphoreRepository {
    async fn load_or_create(&self, name: &str) -> anyhow::Result<VersionedSemaphoreOwners> {
        let mut semaphores = self.semaphores.write().await;
        let record = semaphores
            .entry(name.to_string())
            .or_insert_with(|| SemaphoreRecord {
                owners: SemaphoreOwners::empty(name),
                concurrency_token: Uuid::new_v4(),
            });
        Ok(VersionedSemaphoreOwners {
            owners: record.owners.clone(),
            concurrency_token: record.concurrency_token,
        })
    }

    async fn compare_and_swap(
        &self,
        expected_token: Uuid,
        owners: &SemaphoreOwners,
    ) -> anyhow::Result<bool> {
        let mut semaphores = self.semaphores.write().await;
        match semaphores.get_mut(&owners.name) {
            Some(record) if record.concurrency_token == expected_token => {
                record.owners = owners.clone();
                record.concurrency_token = Uuid::new_v4();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
