//! Transactional outbox for PostgreSQL.
//!
//! Messages are written in the caller's transaction through an
//! [`OutboxSession`], relayed to a [`Dispatcher`] by an [`OutboxStore`], and
//! kept moving by the schedules of an [`OutboxManager`].

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{
    handlers::LogDispatcher,
    services::{
        dispatcher::{Dispatcher, FnDispatcher, OutboundEnvelope},
        manager::{OutboxManager, OutboxManagerConfig, OutboxManagerHandle},
        outbox_session::{DispatchOptions, OutboxSession},
        outbox_store::{OutboxStore, OutboxStoreConfig, RelayOutcome},
        semaphore::DistributedCountingSemaphore,
        transient::{TransientDispatcher, TransientQueue},
    },
};
pub use domain::{
    clock::{Clock, ManualClock, SystemClock},
    errors::{OutboxError, OutboxResult},
    models::{MetaData, OutboxMessage, OutboxMessageStatus, OutboxStats},
    repositories::{OutboxRepository, OutboxUnitOfWork, SemaphoreRepository},
    retry::{ConstantRetryStrategy, ExponentialRetryStrategy, RetryStrategy},
};
