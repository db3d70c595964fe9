//! Send-queue coordination for a chat session: attachment upload tracking,
//! ordered message dispatch and the event surface the UI listens on.

pub mod event_bus;
pub mod send_queue;
pub mod upload_registry;

pub use event_bus::{EventBus, ListenerId};
pub use send_queue::{send_fn, QueuedMessage, SendCallback, SendFuture, SendQueue};
pub use upload_registry::{UploadRecord, UploadRegistry};
