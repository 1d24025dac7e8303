use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{
    clock::{Clock, SystemClock},
    errors::{OutboxError, OutboxResult},
    models::SemaphoreOwner,
    repositories::SemaphoreRepository,
};

/// A named counting semaphore shared through the database.
///
/// Owners hold time-limited leases. Every operation reads the owner set,
/// purges expired leases, applies its change and writes back with a single
/// compare-and-swap on the row's concurrency token. Losing that race makes
/// the operation return `false`; callers retry on their own schedule.
pub struct DistributedCountingSemaphore {
    name: String,
    max_concurrent_owners: usize,
    timeout: chrono::Duration,
    repo: Arc<dyn SemaphoreRepository>,
    clock: Arc<dyn Clock>,
}

impl DistributedCountingSemaphore {
    pub fn new(
        name: impl Into<String>,
        max_concurrent_owners: usize,
        timeout: Duration,
        repo: Arc<dyn SemaphoreRepository>,
    ) -> OutboxResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(OutboxError::configuration("semaphore name must not be empty"));
        }
        if max_concurrent_owners == 0 {
            return Err(OutboxError::configuration(
                "semaphore max_concurrent_owners must be positive",
            ));
        }
        let timeout = chrono::Duration::from_std(timeout)
            .ok()
            .filter(|timeout| *timeout > chrono::Duration::zero())
            .ok_or_else(|| OutboxError::configuration("semaphore timeout must be positive"))?;

        Ok(Self {
            name,
            max_concurrent_owners,
            timeout,
            repo,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent_owners(&self) -> usize {
        self.max_concurrent_owners
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.to_std().unwrap_or_default()
    }

    pub async fn try_acquire(&self, owner_id: &str) -> OutboxResult<bool> {
        self.hold(owner_id).await
    }

    /// Same write as [`try_acquire`](Self::try_acquire): an owner whose lease
    /// has already lapsed gets back in only if a slot is free.
    pub async fn try_renew(&self, owner_id: &str) -> OutboxResult<bool> {
        self.hold(owner_id).await
    }

    /// Releasing an owner that holds no lease always succeeds. Expired
    /// leases found along the way are written back on a best-effort basis.
    pub async fn try_release(&self, owner_id: &str) -> OutboxResult<bool> {
        let mut current = self.repo.load_or_create(&self.name).await?;
        let purged = current.owners.purge_expired(self.clock.now());
        let removed = current.owners.remove(owner_id);
        if !removed && purged == 0 {
            return Ok(true);
        }

        let swapped = self
            .repo
            .compare_and_swap(current.concurrency_token, &current.owners)
            .await?;
        if !removed {
            return Ok(true);
        }
        if swapped {
            info!(semaphore = %self.name, owner_id, "semaphore lease released");
        } else {
            debug!(semaphore = %self.name, owner_id, "semaphore release lost a race");
        }
        Ok(swapped)
    }

    /// Live leases as of now, without writing anything.
    pub async fn owners(&self) -> OutboxResult<Vec<SemaphoreOwner>> {
        let mut current = self.repo.load_or_create(&self.name).await?;
        current.owners.purge_expired(self.clock.now());
        Ok(current.owners.owners)
    }

    async fn hold(&self, owner_id: &str) -> OutboxResult<bool> {
        let mut current = self.repo.load_or_create(&self.name).await?;
        let now = self.clock.now();
        current.owners.purge_expired(now);

        let expires_at_utc = now + self.timeout;
        if !current.owners.extend(owner_id, expires_at_utc) {
            if current.owners.len() >= self.max_concurrent_owners {
                debug!(semaphore = %self.name, owner_id, "semaphore is full");
                return Ok(false);
            }
            current.owners.add(owner_id, expires_at_utc);
        }

        let swapped = self
            .repo
            .compare_and_swap(current.concurrency_token, &current.owners)
            .await?;
        if !swapped {
            debug!(semaphore = %self.name, owner_id, "semaphore write lost a race");
        }
        Ok(swapped)
    }
}
