//! Durable, rename-atomic hand-off between pipeline stages

pub mod store;

pub use store::{DirQueue, PendingItem, QueueError, Stage, TEMP_PREFIX};
