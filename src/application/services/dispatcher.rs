use std::future::Future;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::{MetaData, OutboxMessage};

/// What the outbox hands to the surrounding messaging layer for one delivery.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub data: Vec<u8>,
    pub meta_data: MetaData,
    /// `None` leaves destination resolution (by `message_type`) to the dispatcher.
    pub endpoint: Option<String>,
    pub is_transient: bool,
    pub try_count: i32,
}

impl OutboundEnvelope {
    pub fn from_message(message: OutboxMessage, is_transient: bool) -> Self {
        Self {
            message_id: message.id,
            message_type: message.message_type,
            data: message.payload.data,
            meta_data: message.payload.meta_data,
            endpoint: message.endpoint,
            is_transient,
            try_count: message.try_count,
        }
    }
}

/// Delivers a claimed message. Any `Err` counts as a failed attempt.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, envelope: OutboundEnvelope) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Dispatcher`].
pub struct FnDispatcher<F> {
    f: F,
}

impl<F, Fut> FnDispatcher<F>
where
    F: Fn(OutboundEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(OutboundEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn dispatch(&self, envelope: OutboundEnvelope) -> anyhow::Result<()> {
        (self.f)(envelope).await
    }
}
