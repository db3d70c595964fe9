//! Lifecycle tracking for attachment uploads.
//!
//! In-flight uploads live in `active`; once completed or failed a record moves
//! to `finished`, where its result stays available for merging into queued
//! messages until it is released or the registry is cleared.

use serde_json::Value;
use shared::queue::{UploadOptions, UploadStatus};
use std::collections::{HashMap, HashSet};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// A single tracked upload
#[derive(Debug)]
pub struct UploadRecord {
    pub id: String,
    pub status: UploadStatus,
    pub block_queue: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Distinguishes re-registrations of the same id
    generation: u64,
    timeout: Option<AbortHandle>,
}

impl UploadRecord {
    fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadRegistry {
    active: HashMap<String, UploadRecord>,
    /// Ids of active uploads that block the send queue
    blocking: HashSet<String>,
    finished: HashMap<String, UploadRecord>,
    next_generation: u64,
}

pub fn new_upload_id() -> String {
    format!("upload-{}", Uuid::new_v4())
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new upload, replacing any record with the same id.
    /// Returns the registration's generation.
    pub fn register(&mut self, id: &str, options: UploadOptions) -> u64 {
        if let Some(mut previous) = self.active.remove(id) {
            previous.cancel_timeout();
        }
        self.finished.remove(id);
        self.blocking.remove(id);

        self.next_generation += 1;
        let generation = self.next_generation;
        self.active.insert(
            id.to_string(),
            UploadRecord {
                id: id.to_string(),
                status: UploadStatus::Registered,
                block_queue: options.block_queue,
                result: None,
                error: None,
                generation,
                timeout: None,
            },
        );
        if options.block_queue {
            self.blocking.insert(id.to_string());
        }
        generation
    }

    /// Attach the timer that fails this upload if it never finishes.
    pub fn attach_timeout(&mut self, id: &str, handle: AbortHandle) {
        match self.active.get_mut(id) {
            Some(record) => {
                record.cancel_timeout();
                record.timeout = Some(handle);
            }
            None => handle.abort(),
        }
    }

    /// Returns false when the id is not an active upload.
    pub fn start(&mut self, id: &str) -> bool {
        match self.active.get_mut(id) {
            Some(record) => {
                record.status = UploadStatus::Started;
                true
            }
            None => false,
        }
    }

    /// Returns false when the id is not an active upload.
    pub fn complete(&mut self, id: &str, result: Value) -> bool {
        let Some(mut record) = self.take_active(id) else {
            return false;
        };
        record.status = UploadStatus::Completed;
        record.result = Some(result);
        self.finished.insert(id.to_string(), record);
        true
    }

    /// Returns false when the id is not an active upload.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> bool {
        let Some(mut record) = self.take_active(id) else {
            return false;
        };
        record.status = UploadStatus::Failed;
        record.error = Some(error.into());
        self.finished.insert(id.to_string(), record);
        true
    }

    /// Drop a finished record. Active uploads are left alone.
    pub fn release(&mut self, id: &str) -> bool {
        self.finished.remove(id).is_some()
    }

    fn take_active(&mut self, id: &str) -> Option<UploadRecord> {
        let mut record = self.active.remove(id)?;
        record.cancel_timeout();
        self.blocking.remove(id);
        Some(record)
    }

    /// Generation of the active registration for `id`, if any.
    pub fn generation(&self, id: &str) -> Option<u64> {
        self.active.get(id).map(|r| r.generation)
    }

    pub fn status(&self, id: &str) -> Option<UploadStatus> {
        self.active
            .get(id)
            .or_else(|| self.finished.get(id))
            .map(|r| r.status)
    }

    /// Result of a completed upload.
    pub fn result(&self, id: &str) -> Option<&Value> {
        self.finished.get(id).and_then(|r| r.result.as_ref())
    }

    pub fn has_blocking_dependencies(&self) -> bool {
        !self.blocking.is_empty()
    }

    pub fn blocking_count(&self) -> usize {
        self.blocking.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Forget every upload and cancel all pending timeouts.
    pub fn clear(&mut self) {
        for record in self.active.values_mut() {
            record.cancel_timeout();
        }
        self.active.clear();
        self.blocking.clear();
        self.finished.clear();
    }
}
