pub mod manager;
pub mod model;

pub use manager::{QueueDepth, RoleLocationQueue};
pub use model::{Priority, QueueFilter, QueueStatus, RoleLocationQueueEntry};
