pub mod in_memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{
    models::{MetaData, OutboxMessage, OutboxMessageData, OutboxMessageStatus},
    repositories::FaultedClaim,
};

/// One outbox row joined with its payload record, as the claim returns it.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct OutboxRecord {
    pub id: Uuid,
    pub priority_date_utc: DateTime<Utc>,
    pub try_count: i32,
    pub message_type: String,
    pub endpoint: Option<String>,
    pub status: i16,
    pub created_at_utc: DateTime<Utc>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub data: Option<Vec<u8>>,
    pub meta_data: Option<String>,
}

impl OutboxRecord {
    pub fn from_message(message: &OutboxMessage) -> anyhow::Result<Self> {
        Ok(Self {
            id: message.id,
            priority_date_utc: message.priority_date_utc,
            try_count: message.try_count,
            message_type: message.message_type.clone(),
            endpoint: message.endpoint.clone(),
            status: message.status.as_i16(),
            created_at_utc: message.created_at_utc,
            expires_at_utc: message.expires_at_utc,
            data: Some(message.payload.data.clone()),
            meta_data: Some(message.payload.meta_data.to_json()?),
        })
    }

    /// Builds the domain message, or a fault naming what was wrong with the row.
    pub fn hydrate(self) -> Result<OutboxMessage, FaultedClaim> {
        let fault = |reason: String| FaultedClaim {
            id: self.id,
            try_count: self.try_count,
            expires_at_utc: self.expires_at_utc,
            reason,
        };

        let status = OutboxMessageStatus::from_i16(self.status)
            .ok_or_else(|| fault(format!("unknown outbox status {}", self.status)))?;
        let data = self
            .data
            .clone()
            .ok_or_else(|| fault("payload record is missing".to_string()))?;
        let meta_data = MetaData::from_json(self.meta_data.as_deref().unwrap_or_default())
            .map_err(|err| fault(format!("invalid metadata: {err}")))?;

        Ok(OutboxMessage {
            id: self.id,
            priority_date_utc: self.priority_date_utc,
            try_count: self.try_count,
            message_type: self.message_type,
            endpoint: self.endpoint,
            status,
            created_at_utc: self.created_at_utc,
            expires_at_utc: self.expires_at_utc,
            payload: OutboxMessageData { data, meta_data },
        })
    }
}
