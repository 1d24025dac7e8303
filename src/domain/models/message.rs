use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::MetaData;

/// Lifecycle of an outbox row.
///
/// `Processed` is terminal. `Failed` is terminal unless an operator requeues
/// the row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutboxMessageStatus {
    Ready,
    InProgress,
    Processed,
    Failed,
}

impl OutboxMessageStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            OutboxMessageStatus::Ready => 0,
            OutboxMessageStatus::InProgress => 1,
            OutboxMessageStatus::Processed => 2,
            OutboxMessageStatus::Failed => 100,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(OutboxMessageStatus::Ready),
            1 => Some(OutboxMessageStatus::InProgress),
            2 => Some(OutboxMessageStatus::Processed),
            100 => Some(OutboxMessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxMessageStatus::Processed | OutboxMessageStatus::Failed)
    }
}

/// Payload record stored beside the outbox row under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessageData {
    pub data: Vec<u8>,
    pub meta_data: MetaData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub priority_date_utc: DateTime<Utc>,
    pub try_count: i32,
    pub message_type: String,
    pub endpoint: Option<String>,
    pub status: OutboxMessageStatus,
    pub created_at_utc: DateTime<Utc>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub payload: OutboxMessageData,
}

impl OutboxMessage {
    pub fn new(
        message_type: impl Into<String>,
        data: Vec<u8>,
        meta_data: MetaData,
        endpoint: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority_date_utc: now,
            try_count: 0,
            message_type: message_type.into(),
            endpoint,
            status: OutboxMessageStatus::Ready,
            created_at_utc: now,
            expires_at_utc: None,
            payload: OutboxMessageData { data, meta_data },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at_utc, now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.priority_date_utc <= now
    }
}

pub(crate) fn is_expired(expires_at_utc: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at_utc, Some(expires_at) if expires_at <= now)
}

/// Row counts per status, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub ready: u64,
    pub in_progress: u64,
    pub processed: u64,
    pub failed: u64,
}
