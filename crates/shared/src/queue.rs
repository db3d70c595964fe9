//! Types shared between the send queue and the UI layer.

use serde::{Deserialize, Serialize};

/// Free-form metadata attached to a queued chat turn.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key holding the list of attachments handed to the send callback.
pub const ATTACHMENTS_KEY: &str = "attachments";

/// Lifecycle of an attachment upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Registered,
    Started,
    Completed,
    Failed,
}

/// Options for registering an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Whether the send queue waits for this upload before draining
    pub block_queue: bool,
}

impl UploadOptions {
    pub fn non_blocking() -> Self {
        Self { block_queue: false }
    }
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self { block_queue: true }
    }
}

/// Read-only snapshot of a send queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub active_uploads: usize,
    pub blocking_dependencies: usize,
    pub is_processing: bool,
    pub is_paused: bool,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.queue_length == 0 && self.blocking_dependencies == 0 && !self.is_processing
    }
}

/// Errors raised by the send queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Message queue is full (max {max} messages)")]
    QueueFull { max: usize },

    #[error("Send queue has shut down")]
    Closed,
}
