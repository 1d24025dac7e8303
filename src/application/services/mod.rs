pub mod dispatcher;
pub mod manager;
pub mod outbox_session;
pub mod outbox_store;
pub mod semaphore;
pub mod transient;
