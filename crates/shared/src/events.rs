//! Events emitted by a chat session's send queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named event kinds the UI layer can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueEventKind {
    UploadRegistered,
    UploadStarted,
    UploadCompleted,
    UploadFailed,
    MessageQueued,
    MessageCancelled,
    MessageSent,
    MessageSendFailed,
    QueuePaused,
    QueueResumed,
    QueueCleared,
}

impl QueueEventKind {
    pub fn name(self) -> &'static str {
        match self {
            QueueEventKind::UploadRegistered => "uploadRegistered",
            QueueEventKind::UploadStarted => "uploadStarted",
            QueueEventKind::UploadCompleted => "uploadCompleted",
            QueueEventKind::UploadFailed => "uploadFailed",
            QueueEventKind::MessageQueued => "messageQueued",
            QueueEventKind::MessageCancelled => "messageCancelled",
            QueueEventKind::MessageSent => "messageSent",
            QueueEventKind::MessageSendFailed => "messageSendFailed",
            QueueEventKind::QueuePaused => "queuePaused",
            QueueEventKind::QueueResumed => "queueResumed",
            QueueEventKind::QueueCleared => "queueCleared",
        }
    }
}

/// Queue and upload state changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    UploadRegistered {
        upload_id: String,
        block_queue: bool,
    },
    UploadStarted {
        upload_id: String,
    },
    UploadCompleted {
        upload_id: String,
        result: serde_json::Value,
    },
    UploadFailed {
        upload_id: String,
        error: String,
        /// Set when the failure came from the upload timeout
        timed_out: bool,
    },
    MessageQueued {
        message_id: String,
        queue_length: usize,
        enqueued_at: DateTime<Utc>,
    },
    MessageCancelled {
        message_id: String,
    },
    MessageSent {
        message_id: String,
    },
    MessageSendFailed {
        message_id: String,
        error: String,
    },
    QueuePaused,
    QueueResumed,
    QueueCleared,
}

impl QueueEvent {
    pub fn kind(&self) -> QueueEventKind {
        match self {
            QueueEvent::UploadRegistered { .. } => QueueEventKind::UploadRegistered,
            QueueEvent::UploadStarted { .. } => QueueEventKind::UploadStarted,
            QueueEvent::UploadCompleted { .. } => QueueEventKind::UploadCompleted,
            QueueEvent::UploadFailed { .. } => QueueEventKind::UploadFailed,
            QueueEvent::MessageQueued { .. } => QueueEventKind::MessageQueued,
            QueueEvent::MessageCancelled { .. } => QueueEventKind::MessageCancelled,
            QueueEvent::MessageSent { .. } => QueueEventKind::MessageSent,
            QueueEvent::MessageSendFailed { .. } => QueueEventKind::MessageSendFailed,
            QueueEvent::QueuePaused => QueueEventKind::QueuePaused,
            QueueEvent::QueueResumed => QueueEventKind::QueueResumed,
            QueueEvent::QueueCleared => QueueEventKind::QueueCleared,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The upload this event refers to, if any.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            QueueEvent::UploadRegistered { upload_id, .. }
            | QueueEvent::UploadStarted { upload_id }
            | QueueEvent::UploadCompleted { upload_id, .. }
            | QueueEvent::UploadFailed { upload_id, .. } => Some(upload_id),
            _ => None,
        }
    }

    /// The queued message this event refers to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            QueueEvent::MessageQueued { message_id, .. }
            | QueueEvent::MessageCancelled { message_id }
            | QueueEvent::MessageSent { message_id }
            | QueueEvent::MessageSendFailed { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}
