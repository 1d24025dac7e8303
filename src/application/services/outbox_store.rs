use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::services::dispatcher::{Dispatcher, OutboundEnvelope},
    domain::{
        clock::{Clock, SystemClock},
        errors::{OutboxError, OutboxResult},
        models::{OutboxMessage, OutboxStats, message::is_expired},
        repositories::{ClaimedBatch, OutboxRepository},
        retry::RetryStrategy,
    },
};

#[derive(Debug, Clone)]
pub struct OutboxStoreConfig {
    /// Rows claimed per relay pass.
    pub batch_size: u32,
    /// Dispatches running at once within one pass.
    pub max_concurrency: usize,
    /// A failed attempt whose claim count exceeds this goes to `Failed`.
    pub max_tries: i32,
}

impl Default for OutboxStoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 1,
            max_tries: 12,
        }
    }
}

impl OutboxStoreConfig {
    pub fn validate(&self) -> OutboxResult<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::configuration("batch_size must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(OutboxError::configuration("max_concurrency must be positive"));
        }
        if self.max_tries < 1 {
            return Err(OutboxError::configuration("max_tries must be positive"));
        }
        Ok(())
    }
}

/// Tally of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl RelayOutcome {
    fn record(&mut self, settled: Settled) {
        match settled {
            Settled::Processed => self.processed += 1,
            Settled::Retried => self.retried += 1,
            Settled::Failed => self.failed += 1,
            Settled::Unsettled => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Processed,
    Retried,
    Failed,
    /// The completion write did not land; the row stays `InProgress` until reset.
    Unsettled,
}

/// Claims due rows, hands them to a [`Dispatcher`] and records the outcome.
pub struct OutboxStore {
    repo: Arc<dyn OutboxRepository>,
    retry: Arc<dyn RetryStrategy>,
    clock: Arc<dyn Clock>,
    config: OutboxStoreConfig,
}

impl OutboxStore {
    pub fn new(
        repo: Arc<dyn OutboxRepository>,
        retry: Arc<dyn RetryStrategy>,
        config: OutboxStoreConfig,
    ) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            repo,
            retry,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OutboxStoreConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// One relay pass: claim a batch and dispatch it with bounded concurrency.
    ///
    /// A fault while claiming aborts the pass. Faults while recording a single
    /// row's outcome are logged and leave that row to the reset schedule.
    pub async fn relay(&self, dispatcher: &dyn Dispatcher) -> OutboxResult<RelayOutcome> {
        let batch = self
            .repo
            .claim_batch(self.config.batch_size, self.clock.now())
            .await?;
        if batch.is_empty() {
            return Ok(RelayOutcome::default());
        }

        let outcome = self.deliver_batch(dispatcher, batch, false).await;
        debug!(
            claimed = outcome.claimed,
            processed = outcome.processed,
            retried = outcome.retried,
            failed = outcome.failed,
            "outbox relay pass finished"
        );
        Ok(outcome)
    }

    /// Claims one freshly committed row and delivers it ahead of the poller.
    ///
    /// A row that is no longer `Ready` has already been picked up elsewhere
    /// and is left alone.
    pub async fn dispatch_transient(
        &self,
        dispatcher: &dyn Dispatcher,
        id: Uuid,
    ) -> OutboxResult<RelayOutcome> {
        let batch = self.repo.claim_by_id(id, self.clock.now()).await?;
        if batch.is_empty() {
            debug!(message_id = %id, "transient dispatch skipped, row already claimed");
            return Ok(RelayOutcome::default());
        }
        Ok(self.deliver_batch(dispatcher, batch, true).await)
    }

    /// Deletes `Processed` rows whose priority date is at least `age` old.
    pub async fn clean_up(&self, age: Duration) -> OutboxResult<u64> {
        let cutoff = self.cutoff(age)?;
        let count = self.repo.delete_processed(cutoff).await?;
        if count > 0 {
            info!(count, "cleaned up processed outbox messages");
        }
        Ok(count)
    }

    /// Returns `InProgress` rows whose priority date is at least `age` old to `Ready`.
    pub async fn reset(&self, age: Duration) -> OutboxResult<u64> {
        let cutoff = self.cutoff(age)?;
        let count = self.repo.reset_stale(cutoff).await?;
        if count > 0 {
            warn!(count, "reset stuck outbox messages");
        }
        Ok(count)
    }

    /// Gives a `Failed` row a fresh try budget, due immediately.
    pub async fn requeue_failed(&self, id: Uuid) -> OutboxResult<()> {
        if self.repo.requeue_failed(id, self.clock.now()).await? {
            info!(message_id = %id, "requeued failed outbox message");
            Ok(())
        } else {
            Err(OutboxError::NotFound(format!("failed outbox message {id}")))
        }
    }

    pub async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxMessage>> {
        Ok(self.repo.get(id).await?)
    }

    pub async fn stats(&self) -> OutboxResult<OutboxStats> {
        Ok(self.repo.stats().await?)
    }

    fn cutoff(&self, age: Duration) -> OutboxResult<DateTime<Utc>> {
        let age = chrono::Duration::from_std(age)
            .map_err(|_| OutboxError::configuration(format!("age {age:?} is out of range")))?;
        self.clock
            .now()
            .checked_sub_signed(age)
            .ok_or_else(|| OutboxError::configuration(format!("age {age} is out of range")))
    }

    async fn deliver_batch(
        &self,
        dispatcher: &dyn Dispatcher,
        batch: ClaimedBatch,
        is_transient: bool,
    ) -> RelayOutcome {
        let mut outcome = RelayOutcome {
            claimed: batch.len(),
            ..Default::default()
        };

        for fault in batch.faulted {
            warn!(message_id = %fault.id, reason = %fault.reason, "outbox row could not be hydrated");
            let settled = self
                .settle_failure(fault.id, fault.try_count, fault.expires_at_utc)
                .await;
            outcome.record(settled);
        }

        let settled: Vec<Settled> = stream::iter(batch.messages)
            .map(|message| self.deliver(dispatcher, message, is_transient))
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;
        for settled in settled {
            outcome.record(settled);
        }

        outcome
    }

    async fn deliver(
        &self,
        dispatcher: &dyn Dispatcher,
        message: OutboxMessage,
        is_transient: bool,
    ) -> Settled {
        let id = message.id;
        let try_count = message.try_count;
        let expires_at_utc = message.expires_at_utc;

        if message.is_expired(self.clock.now()) {
            info!(message_id = %id, "outbox message expired before dispatch");
            return self.finish(id, self.repo.mark_failed(id).await, Settled::Failed);
        }

        match dispatcher
            .dispatch(OutboundEnvelope::from_message(message, is_transient))
            .await
        {
            Ok(()) => self.finish(id, self.repo.mark_processed(id).await, Settled::Processed),
            Err(err) => {
                warn!(message_id = %id, try_count, error = %err, "outbox dispatch failed");
                self.settle_failure(id, try_count, expires_at_utc).await
            }
        }
    }

    async fn settle_failure(
        &self,
        id: Uuid,
        try_count: i32,
        expires_at_utc: Option<DateTime<Utc>>,
    ) -> Settled {
        let now = self.clock.now();
        if try_count > self.config.max_tries || is_expired(expires_at_utc, now) {
            warn!(message_id = %id, try_count, "outbox message failed permanently");
            return self.finish(id, self.repo.mark_failed(id).await, Settled::Failed);
        }

        let next_attempt = self.retry.next_attempt_at(try_count, now);
        debug!(message_id = %id, try_count, %next_attempt, "outbox message rescheduled");
        self.finish(
            id,
            self.repo.mark_ready(id, next_attempt).await,
            Settled::Retried,
        )
    }

    fn finish(&self, id: Uuid, written: anyhow::Result<bool>, settled: Settled) -> Settled {
        match written {
            Ok(true) => settled,
            Ok(false) => {
                debug!(message_id = %id, ?settled, "outbox row left InProgress before completion");
                Settled::Unsettled
            }
            Err(err) => {
                error!(message_id = %id, ?settled, error = %err, "failed to record outbox outcome");
                Settled::Unsettled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        application::services::dispatcher::FnDispatcher,
        domain::{
            clock::ManualClock,
            models::{MetaData, OutboxMessageStatus},
            retry::{ConstantRetryStrategy, ExponentialRetryStrategy},
        },
        infrastructure::repositories::{OutboxRecord, in_memory::InMemoryOutboxRepository},
    };

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<OutboundEnvelope>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Dispatcher for Recording {
        async fn dispatch(&self, envelope: OutboundEnvelope) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(envelope);
            if self.fail {
                anyhow::bail!("endpoint unavailable");
            }
            Ok(())
        }
    }

    impl Recording {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    fn store(
        repo: &InMemoryOutboxRepository,
        clock: &ManualClock,
        config: OutboxStoreConfig,
    ) -> OutboxStore {
        OutboxStore::new(
            Arc::new(repo.clone()),
            Arc::new(ExponentialRetryStrategy),
            config,
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
    }

    async fn seed(repo: &InMemoryOutboxRepository, clock: &ManualClock) -> Uuid {
        let message = OutboxMessage::new(
            "OrderPlaced",
            b"{\"order\":1}".to_vec(),
            MetaData::new().with("tenant", "acme"),
            None,
            clock.now(),
        );
        repo.insert(&message).await.unwrap();
        message.id
    }

    async fn status(repo: &InMemoryOutboxRepository, id: Uuid) -> OutboxMessageStatus {
        repo.get(id).await.unwrap().unwrap().status
    }

    #[test]
    fn rejects_invalid_config() {
        let repo = InMemoryOutboxRepository::new();
        for config in [
            OutboxStoreConfig {
                batch_size: 0,
                ..Default::default()
            },
            OutboxStoreConfig {
                max_concurrency: 0,
                ..Default::default()
            },
            OutboxStoreConfig {
                max_tries: 0,
                ..Default::default()
            },
        ] {
            let result = OutboxStore::new(
                Arc::new(repo.clone()),
                Arc::new(ExponentialRetryStrategy),
                config,
            );
            assert!(matches!(result, Err(OutboxError::Configuration(_))));
        }
    }

    #[tokio::test]
    async fn relay_marks_successful_dispatch_processed() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let dispatcher = Recording::default();

        let outcome = store(&repo, &clock, OutboxStoreConfig::default())
            .relay(&dispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.processed, 1);
        assert_eq!(status(&repo, id).await, OutboxMessageStatus::Processed);

        let seen = dispatcher.seen.lock().unwrap();
        assert_eq!(seen[0].message_id, id);
        assert_eq!(seen[0].try_count, 1);
        assert!(!seen[0].is_transient);
        assert_eq!(seen[0].meta_data.get("tenant"), Some("acme"));
    }

    #[tokio::test]
    async fn relay_claims_at_most_one_batch() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        for _ in 0..6 {
            seed(&repo, &clock).await;
        }
        let store = store(
            &repo,
            &clock,
            OutboxStoreConfig {
                batch_size: 5,
                max_concurrency: 3,
                ..Default::default()
            },
        );
        let dispatcher = Recording::default();

        assert_eq!(store.relay(&dispatcher).await.unwrap().processed, 5);
        assert_eq!(store.stats().await.unwrap().ready, 1);
        assert_eq!(store.relay(&dispatcher).await.unwrap().processed, 1);
        assert_eq!(store.relay(&dispatcher).await.unwrap(), RelayOutcome::default());
        assert_eq!(dispatcher.count(), 6);
    }

    #[tokio::test]
    async fn failed_dispatch_is_rescheduled_with_backoff() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let started = clock.now();

        let outcome = store(&repo, &clock, OutboxStoreConfig::default())
            .relay(&Recording::failing())
            .await
            .unwrap();

        assert_eq!(outcome.retried, 1);
        let message = repo.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxMessageStatus::Ready);
        assert_eq!(message.try_count, 1);
        assert_eq!(message.priority_date_utc, started + ChronoDuration::seconds(8));
    }

    #[tokio::test]
    async fn rescheduled_message_waits_for_its_priority_date() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        seed(&repo, &clock).await;
        let store = store(&repo, &clock, OutboxStoreConfig::default());

        store.relay(&Recording::failing()).await.unwrap();

        let dispatcher = Recording::default();
        assert_eq!(store.relay(&dispatcher).await.unwrap().claimed, 0);
        clock.advance(ChronoDuration::seconds(8));
        assert_eq!(store.relay(&dispatcher).await.unwrap().processed, 1);
    }

    #[tokio::test]
    async fn message_fails_once_tries_are_exhausted() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let store = OutboxStore::new(
            Arc::new(repo.clone()),
            Arc::new(ConstantRetryStrategy::new(ChronoDuration::seconds(1))),
            OutboxStoreConfig {
                max_tries: 2,
                ..Default::default()
            },
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
        let dispatcher = Recording::failing();

        for expected in [
            OutboxMessageStatus::Ready,
            OutboxMessageStatus::Ready,
            OutboxMessageStatus::Failed,
        ] {
            store.relay(&dispatcher).await.unwrap();
            assert_eq!(status(&repo, id).await, expected);
            clock.advance(ChronoDuration::seconds(1));
        }

        assert_eq!(dispatcher.count(), 3);
        assert_eq!(store.relay(&dispatcher).await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn expired_message_fails_without_dispatch() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let mut message =
            OutboxMessage::new("OrderPlaced", vec![], MetaData::default(), None, clock.now());
        message.expires_at_utc = Some(clock.now() - ChronoDuration::seconds(1));
        repo.insert(&message).await.unwrap();
        let dispatcher = Recording::default();

        let outcome = store(&repo, &clock, OutboxStoreConfig::default())
            .relay(&dispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.failed, 1);
        assert_eq!(dispatcher.count(), 0);
        assert_eq!(status(&repo, message.id).await, OutboxMessageStatus::Failed);
    }

    #[tokio::test]
    async fn failed_attempt_past_expiry_is_not_retried() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let mut message =
            OutboxMessage::new("OrderPlaced", vec![], MetaData::default(), None, clock.now());
        message.expires_at_utc = Some(clock.now() + ChronoDuration::seconds(5));
        repo.insert(&message).await.unwrap();

        let expiring = clock.clone();
        let dispatcher = FnDispatcher::new(move |_| {
            let clock = expiring.clone();
            async move {
                clock.advance(ChronoDuration::seconds(10));
                Err::<(), _>(anyhow::anyhow!("slow endpoint"))
            }
        });

        store(&repo, &clock, OutboxStoreConfig::default())
            .relay(&dispatcher)
            .await
            .unwrap();

        assert_eq!(status(&repo, message.id).await, OutboxMessageStatus::Failed);
    }

    #[tokio::test]
    async fn unhydratable_row_goes_through_retry_bookkeeping() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let mut record = OutboxRecord::from_message(&repo.get(id).await.unwrap().unwrap()).unwrap();
        record.data = None;
        repo.insert_record(record).await;

        let dispatcher = Recording::default();
        let healthy = seed(&repo, &clock).await;

        let outcome = store(&repo, &clock, OutboxStoreConfig::default())
            .relay(&dispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.claimed, 2);
        assert_eq!(outcome.retried, 1);
        assert_eq!(outcome.processed, 1);
        assert_eq!(dispatcher.count(), 1);
        assert_eq!(status(&repo, healthy).await, OutboxMessageStatus::Processed);
    }

    #[tokio::test]
    async fn transient_dispatch_claims_only_its_own_row() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let other = seed(&repo, &clock).await;
        let store = store(&repo, &clock, OutboxStoreConfig::default());
        let dispatcher = Recording::default();

        let outcome = store.dispatch_transient(&dispatcher, id).await.unwrap();

        assert_eq!(outcome.processed, 1);
        assert!(dispatcher.seen.lock().unwrap()[0].is_transient);
        assert_eq!(status(&repo, other).await, OutboxMessageStatus::Ready);

        // Already processed, so a second attempt is a no-op.
        let again = store.dispatch_transient(&dispatcher, id).await.unwrap();
        assert_eq!(again.claimed, 0);
        assert_eq!(dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn failed_transient_dispatch_leaves_the_row_to_the_poller() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let store = store(&repo, &clock, OutboxStoreConfig::default());
        let started = clock.now();

        let outcome = store
            .dispatch_transient(&Recording::failing(), id)
            .await
            .unwrap();
        assert_eq!(outcome.retried, 1);

        let message = repo.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxMessageStatus::Ready);
        assert_eq!(message.try_count, 1);
        assert_eq!(message.priority_date_utc, started + ChronoDuration::seconds(8));

        let dispatcher = Recording::default();
        assert_eq!(store.relay(&dispatcher).await.unwrap(), RelayOutcome::default());
        assert_eq!(dispatcher.count(), 0);

        clock.advance(ChronoDuration::seconds(8));
        assert_eq!(store.relay(&dispatcher).await.unwrap().processed, 1);
        assert_eq!(repo.get(id).await.unwrap().unwrap().try_count, 2);
    }

    #[tokio::test]
    async fn reset_and_clean_up_respect_age() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let stuck = seed(&repo, &clock).await;
        let store = store(&repo, &clock, OutboxStoreConfig::default());

        repo.claim_batch(1, clock.now()).await.unwrap();
        assert_eq!(store.reset(Duration::from_secs(60)).await.unwrap(), 0);

        clock.advance(ChronoDuration::seconds(60));
        assert_eq!(store.reset(Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(status(&repo, stuck).await, OutboxMessageStatus::Ready);

        store.relay(&Recording::default()).await.unwrap();
        assert_eq!(store.clean_up(Duration::from_secs(3600)).await.unwrap(), 0);
        clock.advance(ChronoDuration::seconds(3600));
        assert_eq!(store.clean_up(Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn requeue_failed_restores_a_fresh_budget() {
        let repo = InMemoryOutboxRepository::new();
        let clock = ManualClock::default();
        let id = seed(&repo, &clock).await;
        let store = store(
            &repo,
            &clock,
            OutboxStoreConfig {
                max_tries: 1,
                ..Default::default()
            },
        );
        let failing = Recording::failing();
        store.relay(&failing).await.unwrap();
        clock.advance(ChronoDuration::seconds(8));
        store.relay(&failing).await.unwrap();
        assert_eq!(status(&repo, id).await, OutboxMessageStatus::Failed);

        store.requeue_failed(id).await.unwrap();
        let message = repo.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxMessageStatus::Ready);
        assert_eq!(message.try_count, 0);

        assert!(matches!(
            store.requeue_failed(id).await,
            Err(OutboxError::NotFound(_))
        ));
    }
}
