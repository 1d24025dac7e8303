use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::OutboxRecord;
use crate::domain::{
    models::{
        OutboxMessage, OutboxMessageStatus, OutboxStats, SemaphoreOwners, VersionedSemaphoreOwners,
    },
    repositories::{ClaimedBatch, OutboxRepository, OutboxUnitOfWork, SemaphoreRepository},
};

pub type PgPool = Pool<Postgres>;

// Both claims lock the candidate rows with SKIP LOCKED and flip them in the same
// statement, so racing relays partition the due rows between them.
const CLAIM_BATCH_SQL: &str = r#"
    WITH claimable AS (
        SELECT id
        FROM outbox_messages
        WHERE status = 0
          AND priority_date_utc <= $1
        ORDER BY priority_date_utc ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    UPDATE outbox_messages AS m
    SET status = 1,
        try_count = m.try_count + 1
    FROM claimable
    LEFT JOIN outbox_message_data AS d ON d.id = claimable.id
    WHERE m.id = claimable.id
    RETURNING
        m.id, m.priority_date_utc, m.try_count, m.message_type, m.endpoint, m.status,
        m.created_at_utc, m.expires_at_utc, d.data, d.meta_data
"#;

const CLAIM_BY_ID_SQL: &str = r#"
    WITH claimable AS (
        SELECT id
        FROM outbox_messages
        WHERE id = $1
          AND status = 0
          AND priority_date_utc <= $2
        FOR UPDATE SKIP LOCKED
    )
    UPDATE outbox_messages AS m
    SET status = 1,
        try_count = m.try_count + 1
    FROM claimable
    LEFT JOIN outbox_message_data AS d ON d.id = claimable.id
    WHERE m.id = claimable.id
    RETURNING
        m.id, m.priority_date_utc, m.try_count, m.message_type, m.endpoint, m.status,
        m.created_at_utc, m.expires_at_utc, d.data, d.meta_data
"#;

#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    async fn set_status_if_in_progress(&self, id: Uuid, status: OutboxMessageStatus) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2
            WHERE id = $1
              AND status = $3
            "#,
        )
        .bind(id)
        .bind(status.as_i16())
        .bind(OutboxMessageStatus::InProgress.as_i16())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark outbox message {id} {status:?}"))?;
        Ok(result.rows_affected() == 1)
    }
}

fn into_batch(records: Vec<OutboxRecord>) -> ClaimedBatch {
    let mut batch = ClaimedBatch::default();
    for record in records {
        match record.hydrate() {
            Ok(message) => batch.messages.push(message),
            Err(fault) => batch.faulted.push(fault),
        }
    }
    batch
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn claim_batch(&self, batch_size: u32, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch> {
        let records = sqlx::query_as::<_, OutboxRecord>(CLAIM_BATCH_SQL)
            .bind(now)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await
            .context("failed to claim outbox batch")?;
        Ok(into_batch(records))
    }

    async fn claim_by_id(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<ClaimedBatch> {
        let records = sqlx::query_as::<_, OutboxRecord>(CLAIM_BY_ID_SQL)
            .bind(id)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to claim outbox message {id}"))?;
        Ok(into_batch(records))
    }

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<bool> {
        self.set_status_if_in_progress(id, OutboxMessageStatus::Processed).await
    }

    async fn mark_ready(&self, id: Uuid, priority_date_utc: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 0,
                priority_date_utc = $2
            WHERE id = $1
              AND status = 1
            "#,
        )
        .bind(id)
        .bind(priority_date_utc)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to reschedule outbox message {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: Uuid) -> anyhow::Result<bool> {
        self.set_status_if_in_progress(id, OutboxMessageStatus::Failed).await
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 0
            WHERE status = 1
              AND priority_date_utc <= $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("failed to reset stale outbox messages")?;
        Ok(result.rows_affected())
    }

    async fn delete_processed(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        // outbox_message_data rows go with ON DELETE CASCADE.
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_messages
            WHERE status = 2
              AND priority_date_utc <= $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("failed to clean up processed outbox messages")?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 0,
                try_count = 0,
                priority_date_utc = $2
            WHERE id = $1
              AND status = 100
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to requeue outbox message {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OutboxMessage>> {
        let record = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT
                m.id, m.priority_date_utc, m.try_count, m.message_type, m.endpoint, m.status,
                m.created_at_utc, m.expires_at_utc, d.data, d.meta_data
            FROM outbox_messages AS m
            LEFT JOIN outbox_message_data AS d ON d.id = m.id
            WHERE m.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        record
            .map(|record| record.hydrate().map_err(|fault| anyhow::anyhow!(fault.reason)))
            .transpose()
    }

    async fn stats(&self) -> anyhow::Result<OutboxStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM outbox_messages
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count outbox messages")?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: i16 = row.try_get("status")?;
            let total = row.try_get::<i64, _>("total")? as u64;
            match OutboxMessageStatus::from_i16(status) {
                Some(OutboxMessageStatus::Ready) => stats.ready = total,
                Some(OutboxMessageStatus::InProgress) => stats.in_progress = total,
                Some(OutboxMessageStatus::Processed) => stats.processed = total,
                Some(OutboxMessageStatus::Failed) => stats.failed = total,
                None => anyhow::bail!("unknown outbox status {status}"),
            }
        }
        Ok(stats)
    }
}

/// Appends ride the caller's transaction; committing it is the caller's job.
#[async_trait]
impl<'c> OutboxUnitOfWork for Transaction<'c, Postgres> {
    async fn append(&mut self, message: &OutboxMessage) -> anyhow::Result<()> {
        let meta_data = message.payload.meta_data.to_json()?;

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, priority_date_utc, try_count, message_type, endpoint, status,
                created_at_utc, expires_at_utc
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(message.id)
        .bind(message.priority_date_utc)
        .bind(message.try_count)
        .bind(&message.message_type)
        .bind(&message.endpoint)
        .bind(message.status.as_i16())
        .bind(message.created_at_utc)
        .bind(message.expires_at_utc)
        .execute(&mut **self)
        .await
        .with_context(|| format!("failed to append outbox message {}", message.id))?;

        sqlx::query(
            r#"
            INSERT INTO outbox_message_data (id, data, meta_data)
            VALUES ($1,$2,$3)
            "#,
        )
        .bind(message.id)
        .bind(&message.payload.data)
        .bind(meta_data)
        .execute(&mut **self)
        .await
        .with_context(|| format!("failed to append outbox payload {}", message.id))?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresSemaphoreRepository {
    pool: PgPool,
}

impl PostgresSemaphoreRepository {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl SemaphoreRepository for PostgresSemaphoreRepository {
    async fn load_or_create(&self, name: &str) -> anyhow::Result<VersionedSemaphoreOwners> {
        let empty = serde_json::to_string(&SemaphoreOwners::empty(name))?;
        sqlx::query(
            r#"
            INSERT INTO semaphores (name, owners, concurrency_token)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(empty)
        .bind(Uuid::new_v4())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create semaphore {name}"))?;

        let row = sqlx::query(
            r#"
            SELECT owners, concurrency_token
            FROM semaphores
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to load semaphore {name}"))?;

        let raw: String = row.try_get("owners")?;
        let mut owners: SemaphoreOwners = serde_json::from_str(&raw)
            .with_context(|| format!("semaphore {name} holds an unreadable owner set"))?;
        owners.name = name.to_string();

        Ok(VersionedSemaphoreOwners {
            owners,
            concurrency_token: row.try_get("concurrency_token")?,
        })
    }

    async fn compare_and_swap(
        &self,
        expected_token: Uuid,
        owners: &SemaphoreOwners,
    ) -> anyhow::Result<bool> {
        let raw = serde_json::to_string(owners)?;
        let result = sqlx::query(
            r#"
            UPDATE semaphores
            SET owners = $2,
                concurrency_token = $3
            WHERE name = $1
              AND concurrency_token = $4
            "#,
        )
        .bind(&owners.name)
        .bind(raw)
        .bind(Uuid::new_v4())
        .bind(expected_token)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update semaphore {}", owners.name))?;
        Ok(result.rows_affected() == 1)
    }
}
