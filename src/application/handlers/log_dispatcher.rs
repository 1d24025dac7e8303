use async_trait::async_trait;
use tracing::info;

use crate::application::services::dispatcher::{Dispatcher, OutboundEnvelope};

/// Dispatcher that only records what it would have delivered.
#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

impl LogDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, envelope: OutboundEnvelope) -> anyhow::Result<()> {
        info!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            endpoint = envelope.endpoint.as_deref().unwrap_or("<by type>"),
            bytes = envelope.data.len(),
            correlation_id = envelope.meta_data.correlation_id().unwrap_or_default(),
            transient = envelope.is_transient,
            try_count = envelope.try_count,
            "dispatching outbox message"
        );
        Ok(())
    }
}
