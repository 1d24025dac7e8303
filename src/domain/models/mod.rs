pub mod message;
pub mod metadata;
pub mod semaphore;

pub use message::{OutboxMessage, OutboxMessageData, OutboxMessageStatus, OutboxStats};
pub use metadata::MetaData;
pub use semaphore::{SemaphoreOwner, SemaphoreOwners, VersionedSemaphoreOwners};
