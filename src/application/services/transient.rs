use std::sync::Arc;

use tokio::{
    sync::{Semaphore, mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::services::{dispatcher::Dispatcher, outbox_store::OutboxStore};

/// Sending side of the transient dispatch pool.
///
/// Enqueueing never blocks the caller. When the pool is saturated or gone the
/// id is dropped and the poller delivers the row on its next pass.
#[derive(Debug, Clone)]
pub struct TransientQueue {
    tx: mpsc::Sender<Uuid>,
}

impl TransientQueue {
    pub fn enqueue(&self, id: Uuid) -> bool {
        match self.tx.try_send(id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(id)) => {
                debug!(message_id = %id, "transient queue full, leaving message to the poller");
                false
            }
            Err(mpsc::error::TrySendError::Closed(id)) => {
                debug!(message_id = %id, "transient queue closed, leaving message to the poller");
                false
            }
        }
    }
}

/// Worker pool delivering freshly committed messages ahead of the poller.
pub struct TransientDispatcher {
    store: Arc<OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    max_concurrency: usize,
}

impl TransientDispatcher {
    pub fn new(
        store: Arc<OutboxStore>,
        dispatcher: Arc<dyn Dispatcher>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Starts the pool. Once `shutdown` flips, the queue stops accepting ids,
    /// everything already queued is delivered, and the returned task finishes.
    pub fn spawn(
        self,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (TransientQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(self.run(rx, shutdown));
        (TransientQueue { tx }, worker)
    }

    async fn run(self, mut rx: mpsc::Receiver<Uuid>, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = JoinSet::new();
        let mut draining = *shutdown.borrow();
        if draining {
            rx.close();
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed(), if !draining => {
                    draining = true;
                    rx.close();
                    continue;
                }
                next = rx.recv() => next,
            };
            let Some(id) = next else { break };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let dispatcher = self.dispatcher.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                if let Err(err) = store.dispatch_transient(dispatcher.as_ref(), id).await {
                    warn!(message_id = %id, error = %err, "transient dispatch failed");
                }
            });

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        info!("transient dispatch pool drained");
    }
}
