use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    application::services::{
        dispatcher::Dispatcher,
        outbox_session::OutboxSession,
        outbox_store::OutboxStore,
        semaphore::DistributedCountingSemaphore,
        transient::{TransientDispatcher, TransientQueue},
    },
    domain::errors::{OutboxError, OutboxResult},
};

#[derive(Debug, Clone)]
pub struct OutboxManagerConfig {
    pub dispatch_frequency: Duration,
    pub reset_frequency: Duration,
    /// `InProgress` rows older than this are presumed abandoned.
    pub reset_age: Duration,
    pub cleanup_frequency: Duration,
    pub cleanup_age: Duration,
    pub disable_transient_dispatch: bool,
    pub transient_max_concurrency: usize,
    pub transient_queue_capacity: usize,
}

impl Default for OutboxManagerConfig {
    fn default() -> Self {
        Self {
            dispatch_frequency: Duration::from_secs(3),
            reset_frequency: Duration::from_secs(30),
            reset_age: Duration::from_secs(60),
            cleanup_frequency: Duration::from_secs(3600),
            cleanup_age: Duration::from_secs(3600),
            disable_transient_dispatch: false,
            transient_max_concurrency: 1,
            transient_queue_capacity: 1024,
        }
    }
}

impl OutboxManagerConfig {
    pub fn validate(&self) -> OutboxResult<()> {
        for (name, value) in [
            ("dispatch_frequency", self.dispatch_frequency),
            ("reset_frequency", self.reset_frequency),
            ("reset_age", self.reset_age),
            ("cleanup_frequency", self.cleanup_frequency),
            ("cleanup_age", self.cleanup_age),
        ] {
            if value.is_zero() {
                return Err(OutboxError::configuration(format!("{name} must be positive")));
            }
        }
        if self.transient_max_concurrency == 0 {
            return Err(OutboxError::configuration(
                "transient_max_concurrency must be positive",
            ));
        }
        if self.transient_queue_capacity == 0 {
            return Err(OutboxError::configuration(
                "transient_queue_capacity must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Lease {
    semaphore: Arc<DistributedCountingSemaphore>,
    owner_id: String,
}

/// Runs the dispatch, reset and cleanup schedules for one [`OutboxStore`],
/// optionally gated on a [`DistributedCountingSemaphore`] lease.
pub struct OutboxManager {
    store: Arc<OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: OutboxManagerConfig,
    lease: Option<Lease>,
}

impl OutboxManager {
    pub fn new(
        store: Arc<OutboxStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: OutboxManagerConfig,
    ) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            dispatcher,
            config,
            lease: None,
        })
    }

    /// Only dispatch while `owner_id` holds a lease on `semaphore`.
    /// Reset and cleanup keep running regardless.
    pub fn with_semaphore(
        mut self,
        semaphore: Arc<DistributedCountingSemaphore>,
        owner_id: impl Into<String>,
    ) -> Self {
        self.lease = Some(Lease {
            semaphore,
            owner_id: owner_id.into(),
        });
        self
    }

    /// Spawns every schedule on the current tokio runtime.
    pub fn start(self) -> OutboxManagerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lease_tx, lease_rx) = watch::channel(self.lease.is_none());
        let mut schedules = Vec::new();

        let gate = self.lease.as_ref().map(|_| lease_rx.clone());
        let (store, dispatcher) = (self.store.clone(), self.dispatcher.clone());
        schedules.push(spawn_schedule(
            "dispatch",
            self.config.dispatch_frequency,
            shutdown_rx.clone(),
            gate,
            move || {
                let (store, dispatcher) = (store.clone(), dispatcher.clone());
                async move {
                    store.relay(dispatcher.as_ref()).await?;
                    Ok(())
                }
            },
        ));

        let (store, age) = (self.store.clone(), self.config.reset_age);
        schedules.push(spawn_schedule(
            "reset",
            self.config.reset_frequency,
            shutdown_rx.clone(),
            None,
            move || {
                let store = store.clone();
                async move {
                    store.reset(age).await?;
                    Ok(())
                }
            },
        ));

        let (store, age) = (self.store.clone(), self.config.cleanup_age);
        schedules.push(spawn_schedule(
            "cleanup",
            self.config.cleanup_frequency,
            shutdown_rx.clone(),
            None,
            move || {
                let store = store.clone();
                async move {
                    store.clean_up(age).await?;
                    Ok(())
                }
            },
        ));

        if let Some(lease) = self.lease.clone() {
            let period = lease.semaphore.timeout().mul_f64(0.8);
            let lease_tx = Arc::new(lease_tx);
            schedules.push(spawn_schedule(
                "lease",
                period,
                shutdown_rx.clone(),
                None,
                move || renew_lease(lease.clone(), lease_tx.clone()),
            ));
        }

        let transient = (!self.config.disable_transient_dispatch).then(|| {
            TransientDispatcher::new(
                self.store.clone(),
                self.dispatcher.clone(),
                self.config.transient_max_concurrency,
            )
            .spawn(self.config.transient_queue_capacity, shutdown_rx.clone())
        });

        info!(
            gated = self.lease.is_some(),
            transient = transient.is_some(),
            "outbox manager started"
        );

        OutboxManagerHandle {
            store: self.store,
            shutdown: shutdown_tx,
            lease_state: lease_rx,
            schedules,
            transient,
            lease: self.lease,
        }
    }
}

async fn renew_lease(lease: Lease, state: Arc<watch::Sender<bool>>) -> OutboxResult<()> {
    let held = match lease.semaphore.try_renew(&lease.owner_id).await {
        Ok(held) => held,
        Err(err) => {
            // Without a confirmed renewal the lease may lapse under us.
            state.send_if_modified(|current| std::mem::replace(current, false));
            return Err(err);
        }
    };

    let was_held = state.send_replace(held);
    match (was_held, held) {
        (false, true) => info!(owner_id = %lease.owner_id, semaphore = lease.semaphore.name(), "outbox lease acquired"),
        (true, false) => warn!(owner_id = %lease.owner_id, semaphore = lease.semaphore.name(), "outbox lease lost"),
        _ => {}
    }
    Ok(())
}

/// Runs `tick` every `period` after the previous run finished.
///
/// A failing or panicking run is logged and the schedule carries on. With a
/// `gate`, runs only start while it reads `true` and are abandoned when it
/// flips to `false`. An abandoned dispatch pass leaves its claimed rows
/// `InProgress`, including ones the dispatcher already delivered; the reset
/// schedule hands them out again once they pass the reset age.
fn spawn_schedule<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut gate: Option<watch::Receiver<bool>>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = OutboxResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(gate) = gate.as_mut() {
                if !wait_open(gate, &mut shutdown).await {
                    break;
                }
            }

            let run = AssertUnwindSafe(tick()).catch_unwind();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = closed(gate.as_mut()) => {
                    debug!(schedule = name, "outbox schedule run abandoned");
                    continue;
                }
                result = run => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(schedule = name, error = %err, "outbox schedule run failed"),
                    Err(_) => error!(schedule = name, "outbox schedule run panicked"),
                },
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!(schedule = name, "outbox schedule stopped");
    })
}

/// Waits until `gate` reads `true`. Returns false on shutdown.
async fn wait_open(gate: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *gate.borrow_and_update() {
            return true;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => return false,
            changed = gate.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Resolves once `gate` flips to `false`; never without a gate.
async fn closed(gate: Option<&mut watch::Receiver<bool>>) {
    let Some(gate) = gate else {
        return futures::future::pending().await;
    };
    loop {
        if gate.changed().await.is_err() {
            return futures::future::pending().await;
        }
        if !*gate.borrow_and_update() {
            return;
        }
    }
}

/// Control surface of a running [`OutboxManager`].
pub struct OutboxManagerHandle {
    store: Arc<OutboxStore>,
    shutdown: watch::Sender<bool>,
    lease_state: watch::Receiver<bool>,
    schedules: Vec<JoinHandle<()>>,
    transient: Option<(TransientQueue, JoinHandle<()>)>,
    lease: Option<Lease>,
}

impl OutboxManagerHandle {
    /// True while dispatch is allowed to run. Always true without a semaphore.
    pub fn holds_lease(&self) -> bool {
        *self.lease_state.borrow()
    }

    pub fn lease_changes(&self) -> watch::Receiver<bool> {
        self.lease_state.clone()
    }

    pub fn transient_queue(&self) -> Option<TransientQueue> {
        self.transient.as_ref().map(|(queue, _)| queue.clone())
    }

    /// A write session wired to this manager's transient pool.
    pub fn session(&self) -> OutboxSession {
        OutboxSession::new(self.store.clock(), self.transient_queue())
    }

    pub fn store(&self) -> Arc<OutboxStore> {
        self.store.clone()
    }

    /// Stops every schedule, drains the transient pool and gives up the lease.
    ///
    /// A dispatch pass cut short here leaves its rows `InProgress`; the reset
    /// schedule of a surviving instance returns them to `Ready`.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for schedule in self.schedules {
            if let Err(err) = schedule.await {
                error!(error = %err, "outbox schedule task ended abnormally");
            }
        }

        if let Some((queue, worker)) = self.transient {
            drop(queue);
            if let Err(err) = worker.await {
                error!(error = %err, "transient dispatch pool ended abnormally");
            }
        }

        // A renewal that lost its write may still have left us in the owner set.
        if let Some(lease) = self.lease {
            match lease.semaphore.try_release(&lease.owner_id).await {
                Ok(true) => {}
                Ok(false) => warn!(owner_id = %lease.owner_id, "outbox lease release lost a race, it will expire"),
                Err(err) => warn!(owner_id = %lease.owner_id, error = %err, "failed to release outbox lease"),
            }
        }

        info!("outbox manager stopped");
    }
}
