use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    application::services::transient::TransientQueue,
    domain::{
        clock::Clock,
        errors::{OutboxError, OutboxResult},
        models::{MetaData, OutboxMessage},
        repositories::OutboxUnitOfWork,
    },
};

/// Per-message choices made at write time.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Holds the message back from both the poller and transient dispatch.
    pub delay: Option<Duration>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    /// Relative alternative to `expires_at_utc`; the earlier of the two wins.
    pub expires_in: Option<Duration>,
    pub skip_transient_dispatch: bool,
}

impl DispatchOptions {
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn expiring_at(mut self, expires_at_utc: DateTime<Utc>) -> Self {
        self.expires_at_utc = Some(expires_at_utc);
        self
    }

    pub fn expiring_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn without_transient_dispatch(mut self) -> Self {
        self.skip_transient_dispatch = true;
        self
    }
}

/// Write side of the outbox for one business transaction.
///
/// Messages are appended through the caller's unit of work. Ids eligible for
/// transient dispatch are held until [`committed`](Self::committed) and
/// forgotten on [`rolled_back`](Self::rolled_back).
pub struct OutboxSession {
    clock: Arc<dyn Clock>,
    transient: Option<TransientQueue>,
    enlisted: Vec<Uuid>,
}

impl OutboxSession {
    /// `transient` is `None` when transient dispatch is disabled globally.
    pub fn new(clock: Arc<dyn Clock>, transient: Option<TransientQueue>) -> Self {
        Self {
            clock,
            transient,
            enlisted: Vec::new(),
        }
    }

    pub async fn dispatch<U>(
        &mut self,
        uow: &mut U,
        message_type: &str,
        data: Vec<u8>,
        mut meta_data: MetaData,
        endpoint: Option<String>,
        options: DispatchOptions,
    ) -> OutboxResult<Uuid>
    where
        U: OutboxUnitOfWork + ?Sized,
    {
        if message_type.trim().is_empty() {
            return Err(OutboxError::configuration("message_type must not be empty"));
        }

        let now = self.clock.now();
        let mut message = OutboxMessage::new(message_type, data, MetaData::default(), endpoint, now);

        if let Some(delay) = options.delay {
            message.priority_date_utc = offset(now, delay)?;
        }
        let expires_in = options
            .expires_in
            .map(|expires_in| offset(now, expires_in))
            .transpose()?;
        message.expires_at_utc = match (options.expires_at_utc, expires_in) {
            (Some(at), Some(within)) => Some(at.min(within)),
            (at, within) => at.or(within),
        };

        if meta_data.message_id().is_none() {
            meta_data.set_message_id(message.id.to_string());
        }
        if let Some(expires_at_utc) = message.expires_at_utc {
            meta_data.set_expires_at(expires_at_utc);
        }
        message.payload.meta_data = meta_data;

        uow.append(&message).await?;

        let transient = self.transient.is_some()
            && !options.skip_transient_dispatch
            && options.delay.is_none();
        if transient {
            self.enlisted.push(message.id);
        }

        debug!(message_id = %message.id, message_type, transient, "outbox message appended");
        Ok(message.id)
    }

    /// Call after the caller's transaction committed. Hands enlisted ids to
    /// the transient pool and returns how many it accepted.
    pub fn committed(&mut self) -> usize {
        let enlisted = std::mem::take(&mut self.enlisted);
        let Some(queue) = &self.transient else {
            return 0;
        };
        enlisted.into_iter().filter(|id| queue.enqueue(*id)).count()
    }

    /// Call after the caller's transaction rolled back. Nothing is dispatched.
    pub fn rolled_back(&mut self) {
        self.enlisted.clear();
    }

    pub fn pending_transient(&self) -> &[Uuid] {
        &self.enlisted
    }
}

fn offset(now: DateTime<Utc>, by: Duration) -> OutboxResult<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .ok_or_else(|| OutboxError::configuration(format!("duration {by:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        application::services::{
            dispatcher::FnDispatcher,
            outbox_store::{OutboxStore, OutboxStoreConfig},
            transient::TransientDispatcher,
        },
        domain::{
            clock::ManualClock, models::OutboxMessageStatus, repositories::OutboxRepository,
            retry::ExponentialRetryStrategy,
        },
        infrastructure::repositories::in_memory::InMemoryOutboxRepository,
    };

    fn session(clock: &ManualClock) -> OutboxSession {
        OutboxSession::new(Arc::new(clock.clone()), None)
    }

    #[tokio::test]
    async fn appends_a_ready_row_inside_the_unit_of_work() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let mut session = session(&clock);
        let mut uow = repo.begin();
        let mut meta_data = MetaData::new();
        meta_data.set_correlation_id("c-1");

        let id = session
            .dispatch(
                &mut uow,
                "OrderPlaced",
                b"{}".to_vec(),
                meta_data,
                Some("orders".to_string()),
                DispatchOptions::default(),
            )
            .await
            .unwrap();

        assert!(repo.get(id).await.unwrap().is_none());
        uow.commit().await;

        let message = repo.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxMessageStatus::Ready);
        assert_eq!(message.try_count, 0);
        assert_eq!(message.priority_date_utc, clock.now());
        assert_eq!(message.endpoint.as_deref(), Some("orders"));
        assert_eq!(message.payload.meta_data.correlation_id(), Some("c-1"));
        assert_eq!(message.payload.meta_data.message_id(), Some(id.to_string().as_str()));
    }

    #[tokio::test]
    async fn delay_and_expiry_are_applied() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let mut session = session(&clock);
        let mut uow = repo.begin();
        let now = clock.now();

        let id = session
            .dispatch(
                &mut uow,
                "OrderPlaced",
                vec![],
                MetaData::default(),
                None,
                DispatchOptions::default()
                    .delayed(Duration::from_secs(30))
                    .expiring_at(now + ChronoDuration::seconds(600))
                    .expiring_in(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        uow.commit().await;

        let message = repo.get(id).await.unwrap().unwrap();
        assert_eq!(message.priority_date_utc, now + ChronoDuration::seconds(30));
        assert_eq!(message.expires_at_utc, Some(now + ChronoDuration::seconds(60)));
        assert_eq!(
            message.payload.meta_data.expires_at(),
            Some(now + ChronoDuration::seconds(60))
        );
    }

    #[tokio::test]
    async fn empty_message_type_is_rejected() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let mut uow = repo.begin();

        let result = session(&clock)
            .dispatch(&mut uow, " ", vec![], MetaData::default(), None, DispatchOptions::default())
            .await;

        assert!(matches!(result, Err(OutboxError::Configuration(_))));
        assert_eq!(uow.pending(), 0);
    }

    #[tokio::test]
    async fn only_committed_eligible_messages_go_transient() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let store = Arc::new(
            OutboxStore::new(
                Arc::new(repo.clone()),
                Arc::new(ExponentialRetryStrategy),
                OutboxStoreConfig::default(),
            )
            .unwrap()
            .with_clock(Arc::new(clock.clone())),
        );
        let dispatcher = FnDispatcher::new(|_| async { Ok::<(), anyhow::Error>(()) });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue, worker) =
            TransientDispatcher::new(store, Arc::new(dispatcher), 1).spawn(16, shutdown_rx);
        let mut session = OutboxSession::new(Arc::new(clock.clone()), Some(queue));

        let mut uow = repo.begin();
        let eager = session
            .dispatch(&mut uow, "A", vec![], MetaData::default(), None, DispatchOptions::default())
            .await
            .unwrap();
        let skipped = session
            .dispatch(
                &mut uow,
                "B",
                vec![],
                MetaData::default(),
                None,
                DispatchOptions::default().without_transient_dispatch(),
            )
            .await
            .unwrap();
        let delayed = session
            .dispatch(
                &mut uow,
                "C",
                vec![],
                MetaData::default(),
                None,
                DispatchOptions::default().delayed(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(session.pending_transient(), &[eager]);
        uow.commit().await;
        assert_eq!(session.committed(), 1);

        let mut rolled_back = repo.begin();
        session
            .dispatch(&mut rolled_back, "D", vec![], MetaData::default(), None, DispatchOptions::default())
            .await
            .unwrap();
        rolled_back.rollback();
        session.rolled_back();
        assert_eq!(session.committed(), 0);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        let status = |id: Uuid| {
            let repo = repo.clone();
            async move { repo.get(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(eager).await, OutboxMessageStatus::Processed);
        assert_eq!(status(skipped).await, OutboxMessageStatus::Ready);
        assert_eq!(status(delayed).await, OutboxMessageStatus::Ready);
        assert_eq!(repo.len().await, 3);
    }
}
