//! Per-session send queue.
//!
//! Outgoing chat turns wait here until every blocking attachment upload has
//! finished, then go out one at a time through the callback supplied with
//! each message. A single task owns all queue and upload state and processes
//! commands from the [`SendQueue`] handles in order; the next message is only
//! handed to its callback after the previous callback's future resolved.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use shared::events::{QueueEvent, QueueEventKind};
use shared::queue::{
    Metadata, QueueError, QueueStatus, UploadOptions, UploadStatus, ATTACHMENTS_KEY,
};
use shared::settings::QueueSettings;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_bus::{EventBus, ListenerId};
use crate::upload_registry::{new_upload_id, UploadRegistry};

pub type SendFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Delivers one chat turn: receives the content and the metadata with
/// completed attachments merged in.
pub type SendCallback = Box<dyn FnOnce(String, Metadata) -> SendFuture + Send>;

/// Wrap an async closure as a [`SendCallback`].
pub fn send_fn<F, Fut>(f: F) -> SendCallback
where
    F: FnOnce(String, Metadata) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |content, metadata| Box::pin(f(content, metadata)))
}

/// A chat turn waiting to be sent
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub attachment_upload_ids: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    on_send: SendCallback,
}

enum Command {
    Register {
        id: String,
        options: UploadOptions,
    },
    Start {
        id: String,
    },
    Complete {
        id: String,
        result: Value,
    },
    Fail {
        id: String,
        error: String,
    },
    TimedOut {
        id: String,
        generation: u64,
    },
    Enqueue {
        message: QueuedMessage,
        reply: oneshot::Sender<Result<String, QueueError>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Pause,
    Resume,
    Clear {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    UploadStatus {
        id: String,
        reply: oneshot::Sender<Option<UploadStatus>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a session's send queue. Cheap to clone; the queue shuts down
/// when the last handle is dropped.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus>,
}

impl SendQueue {
    /// Spawn the queue task. Must be called from within a Tokio runtime.
    pub fn new(settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());

        let actor = QueueActor {
            settings,
            rx,
            weak_tx: tx.downgrade(),
            events: Arc::clone(&events),
            queue: VecDeque::new(),
            uploads: UploadRegistry::new(),
            paused: false,
            in_flight: None,
            idle_waiters: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self { tx, events }
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        self.tx.send(command).map_err(|_| QueueError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    // ── Uploads ──────────────────────────────────────────────────────

    /// Track an upload, reusing `id` when given. Blocking uploads hold back
    /// the whole queue until they complete, fail or time out.
    pub fn register_upload(
        &self,
        id: Option<String>,
        options: UploadOptions,
    ) -> Result<String, QueueError> {
        let id = id.unwrap_or_else(new_upload_id);
        self.send(Command::Register {
            id: id.clone(),
            options,
        })?;
        Ok(id)
    }

    pub fn start_upload(&self, id: &str) -> Result<(), QueueError> {
        self.send(Command::Start { id: id.to_string() })
    }

    pub fn complete_upload(&self, id: &str, result: Value) -> Result<(), QueueError> {
        self.send(Command::Complete {
            id: id.to_string(),
            result,
        })
    }

    pub fn fail_upload(&self, id: &str, error: impl Into<String>) -> Result<(), QueueError> {
        self.send(Command::Fail {
            id: id.to_string(),
            error: error.into(),
        })
    }

    pub async fn upload_status(&self, id: &str) -> Result<Option<UploadStatus>, QueueError> {
        let id = id.to_string();
        self.request(|reply| Command::UploadStatus { id, reply }).await
    }

    pub async fn has_blocking_dependencies(&self) -> Result<bool, QueueError> {
        Ok(self.status().await?.blocking_dependencies > 0)
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Queue a chat turn. Fails with [`QueueError::QueueFull`] when the queue
    /// already holds `max_queue_size` messages.
    pub async fn queue_message(
        &self,
        content: impl Into<String>,
        metadata: Option<Metadata>,
        attachment_upload_ids: Vec<String>,
        on_send: SendCallback,
    ) -> Result<String, QueueError> {
        let message = QueuedMessage {
            id: format!("msg-{}", Uuid::new_v4()),
            content: content.into(),
            metadata: metadata.unwrap_or_default(),
            attachment_upload_ids,
            enqueued_at: Utc::now(),
            on_send,
        };
        self.request(|reply| Command::Enqueue { message, reply }).await?
    }

    /// Remove a message that has not been handed to its callback yet.
    pub async fn cancel_message(&self, id: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.send(Command::Resume)
    }

    /// Drop every queued message and forget every upload.
    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Resolves once nothing is queued, sending, or blocking.
    pub async fn wait_until_idle(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::WaitIdle { reply }).await
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.request(|reply| Command::Status { reply }).await
    }

    // ── Events ───────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: QueueEventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn remove_all_listeners(&self) {
        self.events.remove_all_listeners()
    }
}

struct InFlight {
    message_id: String,
    future: SendFuture,
}

struct QueueActor {
    settings: QueueSettings,
    rx: mpsc::UnboundedReceiver<Command>,
    /// Handed to upload timers so they never keep the queue alive
    weak_tx: mpsc::WeakUnboundedSender<Command>,
    events: Arc<EventBus>,
    queue: VecDeque<QueuedMessage>,
    uploads: UploadRegistry,
    paused: bool,
    in_flight: Option<InFlight>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

async fn next_send_outcome(in_flight: &mut Option<InFlight>) -> anyhow::Result<()> {
    match in_flight {
        Some(flight) => flight.future.as_mut().await,
        None => std::future::pending().await,
    }
}

impl QueueActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                outcome = next_send_outcome(&mut self.in_flight) => {
                    self.finish_send(outcome);
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
            self.drain();
            self.notify_idle();
        }

        debug!("send queue shut down");
        self.uploads.clear();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { id, options } => self.register_upload(id, options),
            Command::Start { id } => {
                if self.uploads.start(&id) {
                    self.emit(QueueEvent::UploadStarted { upload_id: id });
                } else {
                    debug!("start for unknown upload {}", id);
                }
            }
            Command::Complete { id, result } => {
                if self.uploads.complete(&id, result.clone()) {
                    debug!("upload {} completed", id);
                    self.emit(QueueEvent::UploadCompleted {
                        upload_id: id,
                        result,
                    });
                } else {
                    debug!("completion for unknown upload {}", id);
                }
            }
            Command::Fail { id, error } => self.fail_upload(id, error, false),
            Command::TimedOut { id, generation } => {
                if self.uploads.generation(&id) == Some(generation) {
                    let error = format!(
                        "Upload timeout after {}ms",
                        self.settings.upload_timeout_ms
                    );
                    warn!("upload {} timed out", id);
                    self.fail_upload(id, error, true);
                }
            }
            Command::Enqueue { message, reply } => {
                let _ = reply.send(self.enqueue(message));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id));
            }
            Command::Pause => {
                self.paused = true;
                self.emit(QueueEvent::QueuePaused);
            }
            Command::Resume => {
                self.paused = false;
                self.emit(QueueEvent::QueueResumed);
            }
            Command::Clear { reply } => {
                self.queue.clear();
                self.uploads.clear();
                self.emit(QueueEvent::QueueCleared);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::UploadStatus { id, reply } => {
                let _ = reply.send(self.uploads.status(&id));
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
        }
    }

    fn register_upload(&mut self, id: String, options: UploadOptions) {
        let generation = self.uploads.register(&id, options);

        let weak_tx = self.weak_tx.clone();
        let timeout = self.settings.upload_timeout();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(Command::TimedOut {
                    id: timer_id,
                    generation,
                });
            }
        });
        self.uploads.attach_timeout(&id, timer.abort_handle());

        debug!("upload {} registered (blocking: {})", id, options.block_queue);
        self.emit(QueueEvent::UploadRegistered {
            upload_id: id,
            block_queue: options.block_queue,
        });
    }

    fn fail_upload(&mut self, id: String, error: String, timed_out: bool) {
        if self.uploads.fail(&id, error.clone()) {
            self.emit(QueueEvent::UploadFailed {
                upload_id: id,
                error,
                timed_out,
            });
        } else {
            debug!("failure for unknown upload {}", id);
        }
    }

    fn enqueue(&mut self, message: QueuedMessage) -> Result<String, QueueError> {
        let max = self.settings.max_queue_size;
        if self.queue.len() >= max {
            warn!("rejecting message: queue holds {} messages", self.queue.len());
            return Err(QueueError::QueueFull { max });
        }

        let id = message.id.clone();
        let enqueued_at = message.enqueued_at;
        self.queue.push_back(message);
        self.emit(QueueEvent::MessageQueued {
            message_id: id.clone(),
            queue_length: self.queue.len(),
            enqueued_at,
        });
        Ok(id)
    }

    fn cancel(&mut self, id: &str) -> bool {
        let Some(index) = self.queue.iter().position(|m| m.id == id) else {
            return false;
        };
        if let Some(message) = self.queue.remove(index) {
            self.release_uploads(&message.attachment_upload_ids);
        }
        self.emit(QueueEvent::MessageCancelled {
            message_id: id.to_string(),
        });
        true
    }

    /// Hand the oldest message to its callback if nothing holds the queue back.
    fn drain(&mut self) {
        if self.paused || self.in_flight.is_some() || self.uploads.has_blocking_dependencies() {
            return;
        }
        let Some(message) = self.queue.pop_front() else {
            return;
        };

        let QueuedMessage {
            id,
            content,
            mut metadata,
            attachment_upload_ids,
            on_send,
            ..
        } = message;
        merge_attachments(&mut metadata, &attachment_upload_ids, &self.uploads);
        self.release_uploads(&attachment_upload_ids);

        debug!("sending message {} ({} still queued)", id, self.queue.len());
        let future: SendFuture =
            match std::panic::catch_unwind(AssertUnwindSafe(move || on_send(content, metadata))) {
                Ok(send) => AssertUnwindSafe(send)
                    .catch_unwind()
                    .map(|outcome| {
                        outcome.unwrap_or_else(|_| Err(anyhow!("send callback panicked")))
                    })
                    .boxed(),
                Err(_) => Box::pin(async { Err(anyhow!("send callback panicked")) }),
            };
        self.in_flight = Some(InFlight {
            message_id: id,
            future,
        });
    }

    /// Forget finished uploads that no queued message refers to any more.
    fn release_uploads(&mut self, upload_ids: &[String]) {
        for id in upload_ids {
            let referenced = self
                .queue
                .iter()
                .any(|m| m.attachment_upload_ids.contains(id));
            if !referenced && self.uploads.release(id) {
                debug!("released finished upload {}", id);
            }
        }
    }

    fn finish_send(&mut self, outcome: anyhow::Result<()>) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        match outcome {
            Ok(()) => self.emit(QueueEvent::MessageSent {
                message_id: flight.message_id,
            }),
            Err(err) => {
                warn!("sending message {} failed: {:#}", flight.message_id, err);
                self.emit(QueueEvent::MessageSendFailed {
                    message_id: flight.message_id,
                    error: err.to_string(),
                });
            }
        }
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            active_uploads: self.uploads.active_count(),
            blocking_dependencies: self.uploads.blocking_count(),
            is_processing: self.in_flight.is_some(),
            is_paused: self.paused,
        }
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.status().is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn emit(&self, event: QueueEvent) {
        self.events.emit(&event);
    }
}

/// Append results of completed uploads to the metadata's attachment list,
/// after any attachments already present.
fn merge_attachments(metadata: &mut Metadata, upload_ids: &[String], uploads: &UploadRegistry) {
    let results: Vec<Value> = upload_ids
        .iter()
        .filter_map(|id| uploads.result(id).cloned())
        .collect();
    if results.is_empty() {
        return;
    }

    let entry = metadata.entry(ATTACHMENTS_KEY).or_insert(Value::Null);
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    } else if !entry.is_array() {
        *entry = Value::Array(vec![entry.take()]);
    }
    if let Value::Array(list) = entry {
        list.extend(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    type SendLog = Arc<Mutex<Vec<(String, Metadata)>>>;

    fn recorder(log: &SendLog) -> SendCallback {
        let log = Arc::clone(log);
        send_fn(move |content, metadata| async move {
            log.lock().push((content, metadata));
            Ok(())
        })
    }

    fn metadata(value: Value) -> Option<Metadata> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_sends_immediately_when_unblocked() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        queue
            .queue_message("hello", None, vec![], recorder(&log))
            .await
            .unwrap();
        queue.wait_until_idle().await.unwrap();

        let sent = log.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "hello");
    }

    #[tokio::test]
    async fn test_blocking_upload_holds_message() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        let upload = queue
            .register_upload(None, UploadOptions::default())
            .unwrap();
        queue
            .queue_message(
                "see attached",
                metadata(json!({"attachments": [{"name": "notes.txt"}]})),
                vec![upload.clone()],
                recorder(&log),
            )
            .await
            .unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.blocking_dependencies, 1);
        assert!(log.lock().is_empty());

        queue.start_upload(&upload).unwrap();
        assert_eq!(queue.status().await.unwrap().blocking_dependencies, 1);
        assert!(log.lock().is_empty());

        queue
            .complete_upload(&upload, json!({"name": "photo.png"}))
            .unwrap();
        queue.wait_until_idle().await.unwrap();

        let sent = log.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1[ATTACHMENTS_KEY],
            json!([{"name": "notes.txt"}, {"name": "photo.png"}])
        );
    }

    #[tokio::test]
    async fn test_attachments_merged_in_reference_order() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        let a = queue.register_upload(None, UploadOptions::default()).unwrap();
        let b = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue
            .queue_message("two files", None, vec![a.clone(), b.clone()], recorder(&log))
            .await
            .unwrap();

        queue.complete_upload(&b, json!("b")).unwrap();
        queue.complete_upload(&a, json!("a")).unwrap();
        queue.wait_until_idle().await.unwrap();

        assert_eq!(log.lock()[0].1[ATTACHMENTS_KEY], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_failed_upload_unblocks_without_attachment() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue
            .queue_message("x", None, vec![upload.clone()], recorder(&log))
            .await
            .unwrap();
        queue.fail_upload(&upload, "disk full").unwrap();
        queue.wait_until_idle().await.unwrap();

        let sent = log.lock();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].1.contains_key(ATTACHMENTS_KEY));
        drop(sent);
        assert_eq!(queue.upload_status(&upload).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_finished_uploads_released_after_last_reference() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        queue.pause().unwrap();

        let shared_upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        let dropped = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue.complete_upload(&shared_upload, json!("shared")).unwrap();
        queue.complete_upload(&dropped, json!("dropped")).unwrap();

        queue
            .queue_message("first", None, vec![shared_upload.clone()], recorder(&log))
            .await
            .unwrap();
        let cancelled = queue
            .queue_message("cancelled", None, vec![dropped.clone()], recorder(&log))
            .await
            .unwrap();
        queue
            .queue_message("second", None, vec![shared_upload.clone()], recorder(&log))
            .await
            .unwrap();

        assert!(queue.cancel_message(&cancelled).await.unwrap());
        assert_eq!(queue.upload_status(&dropped).await.unwrap(), None);
        assert_eq!(
            queue.upload_status(&shared_upload).await.unwrap(),
            Some(UploadStatus::Completed)
        );

        queue.resume().unwrap();
        queue.wait_until_idle().await.unwrap();

        let sent = log.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1[ATTACHMENTS_KEY], json!(["shared"]));
        assert_eq!(sent[1].1[ATTACHMENTS_KEY], json!(["shared"]));
        drop(sent);
        assert_eq!(queue.upload_status(&shared_upload).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_blocking_upload_does_not_hold_queue() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        let upload = queue
            .register_upload(Some("file-1".into()), UploadOptions::non_blocking())
            .unwrap();
        assert_eq!(upload, "file-1");
        queue
            .queue_message("x", None, vec![upload], recorder(&log))
            .await
            .unwrap();
        queue.wait_until_idle().await.unwrap();

        assert_eq!(log.lock().len(), 1);
        let status = queue.status().await.unwrap();
        assert_eq!(status.active_uploads, 1);
        assert_eq!(status.blocking_dependencies, 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        queue.pause().unwrap();

        for i in 0..50 {
            queue
                .queue_message(format!("m{}", i), None, vec![], recorder(&log))
                .await
                .unwrap();
        }
        let err = queue
            .queue_message("one too many", None, vec![], recorder(&log))
            .await
            .unwrap_err();

        assert_eq!(err, QueueError::QueueFull { max: 50 });
        assert!(err.to_string().to_lowercase().contains("queue is full"));
        assert_eq!(queue.status().await.unwrap().queue_length, 50);
    }

    #[tokio::test]
    async fn test_custom_queue_size() {
        let queue = SendQueue::new(QueueSettings::default().with_max_queue_size(1));
        let log = SendLog::default();
        queue.pause().unwrap();

        queue.queue_message("a", None, vec![], recorder(&log)).await.unwrap();
        assert!(queue.queue_message("b", None, vec![], recorder(&log)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_message() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        queue.pause().unwrap();

        let first = queue.queue_message("a", None, vec![], recorder(&log)).await.unwrap();
        queue.queue_message("b", None, vec![], recorder(&log)).await.unwrap();
        assert_eq!(queue.status().await.unwrap().queue_length, 2);

        assert!(queue.cancel_message(&first).await.unwrap());
        assert_eq!(queue.status().await.unwrap().queue_length, 1);
        assert!(!queue.cancel_message(&first).await.unwrap());
        assert!(!queue.cancel_message("msg-unknown").await.unwrap());

        queue.resume().unwrap();
        queue.wait_until_idle().await.unwrap();
        let sent = log.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "b");
    }

    #[tokio::test]
    async fn test_cannot_cancel_message_being_sent() {
        let queue = SendQueue::new(QueueSettings::default());
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let id = queue
            .queue_message(
                "slow",
                None,
                vec![],
                send_fn(move |_, _| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        started_rx.await.unwrap();
        assert!(!queue.cancel_message(&id).await.unwrap());
        assert!(queue.status().await.unwrap().is_processing);

        release_tx.send(()).unwrap();
        queue.wait_until_idle().await.unwrap();
        assert!(!queue.status().await.unwrap().is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_sent_one_at_a_time_in_order() {
        let queue = SendQueue::new(QueueSettings::default());
        let trace: Arc<Mutex<Vec<String>>> = Arc::default();
        queue.pause().unwrap();

        for (i, delay_ms) in [300u64, 10, 100].into_iter().enumerate() {
            let trace = Arc::clone(&trace);
            queue
                .queue_message(
                    format!("m{}", i),
                    None,
                    vec![],
                    send_fn(move |content, _| async move {
                        trace.lock().push(format!("start {}", content));
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        trace.lock().push(format!("end {}", content));
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }

        queue.resume().unwrap();
        queue.wait_until_idle().await.unwrap();

        assert_eq!(
            *trace.lock(),
            vec!["start m0", "end m0", "start m1", "end m1", "start m2", "end m2"]
        );
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_drain() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        let mut events = queue.subscribe();
        queue.pause().unwrap();

        let failing = queue
            .queue_message(
                "bad",
                None,
                vec![],
                send_fn(|_, _| async { Err(anyhow!("HTTP 500")) }),
            )
            .await
            .unwrap();
        queue
            .queue_message(
                "boom",
                None,
                vec![],
                send_fn(|content: String, _| async move {
                    assert!(content.is_empty(), "callback bug");
                    Ok(())
                }),
            )
            .await
            .unwrap();
        queue.queue_message("good", None, vec![], recorder(&log)).await.unwrap();

        queue.resume().unwrap();
        queue.wait_until_idle().await.unwrap();
        assert_eq!(log.lock().len(), 1);

        let mut failures = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::MessageSendFailed { message_id, error } = event {
                failures.push((message_id, error));
            }
        }
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, failing);
        assert!(failures[0].1.contains("HTTP 500"));
        assert!(failures[1].1.contains("panicked"));
    }

    #[tokio::test]
    async fn test_pause_holds_unblocked_queue() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        queue.pause().unwrap();

        queue.queue_message("x", None, vec![], recorder(&log)).await.unwrap();
        let status = queue.status().await.unwrap();
        assert!(status.is_paused);
        assert_eq!(status.queue_length, 1);
        assert!(log.lock().is_empty());

        queue.resume().unwrap();
        queue.wait_until_idle().await.unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_queue_resets_session() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        let mut events = queue.subscribe();

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue
            .queue_message("a", None, vec![upload.clone()], recorder(&log))
            .await
            .unwrap();
        queue.queue_message("b", None, vec![], recorder(&log)).await.unwrap();

        queue.clear_queue().await.unwrap();
        assert_eq!(queue.status().await.unwrap(), QueueStatus::default());

        // The upload was forgotten; finishing it later is a no-op
        queue.complete_upload(&upload, json!(1)).unwrap();
        queue.start_upload(&upload).unwrap();
        queue.wait_until_idle().await.unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(queue.upload_status(&upload).await.unwrap(), None);

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec!["uploadRegistered", "messageQueued", "messageQueued", "queueCleared"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_timeout_unblocks_queue() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();
        let mut events = queue.subscribe();
        let started = tokio::time::Instant::now();

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue
            .queue_message("x", None, vec![upload.clone()], recorder(&log))
            .await
            .unwrap();
        assert!(queue.has_blocking_dependencies().await.unwrap());

        let (error, timed_out) = loop {
            match events.recv().await {
                Some(QueueEvent::UploadFailed {
                    upload_id,
                    error,
                    timed_out,
                }) => {
                    assert_eq!(upload_id, upload);
                    break (error, timed_out);
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        };

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(timed_out);
        assert!(error.to_lowercase().contains("timeout"));
        assert!(!queue.has_blocking_dependencies().await.unwrap());

        queue.wait_until_idle().await.unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_upload_never_times_out() {
        let queue = SendQueue::new(QueueSettings::default());
        let mut events = queue.subscribe();

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue.complete_upload(&upload, json!({"ok": true})).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(
            queue.upload_status(&upload).await.unwrap(),
            Some(UploadStatus::Completed)
        );
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, QueueEvent::UploadFailed { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistered_upload_gets_fresh_timeout() {
        let settings = QueueSettings::default().with_upload_timeout(Duration::from_secs(10));
        let queue = SendQueue::new(settings);

        let upload = queue
            .register_upload(Some("u".into()), UploadOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        queue.register_upload(Some(upload.clone()), UploadOptions::default()).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            queue.upload_status(&upload).await.unwrap(),
            Some(UploadStatus::Registered)
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            queue.upload_status(&upload).await.unwrap(),
            Some(UploadStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_waits_for_upload_and_send() {
        let queue = SendQueue::new(QueueSettings::default());
        let log = SendLog::default();

        // Already idle
        queue.wait_until_idle().await.unwrap();

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue
            .queue_message("x", None, vec![upload.clone()], recorder(&log))
            .await
            .unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_secs(1), queue.wait_until_idle()).await;
        assert!(blocked.is_err());

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.wait_until_idle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        queue.complete_upload(&upload, json!("file")).unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_listeners_receive_named_events() {
        let queue = SendQueue::new(QueueSettings::default());
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let s = Arc::clone(&seen);
        queue.on_any(move |event| s.lock().push(event.name()));
        queue.on(QueueEventKind::QueuePaused, |_| panic!("listener bug"));

        let upload = queue.register_upload(None, UploadOptions::default()).unwrap();
        queue.start_upload(&upload).unwrap();
        queue.pause().unwrap();
        queue.resume().unwrap();
        queue.complete_upload(&upload, json!(1)).unwrap();
        queue.wait_until_idle().await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                "uploadRegistered",
                "uploadStarted",
                "queuePaused",
                "queueResumed",
                "uploadCompleted"
            ]
        );

        queue.remove_all_listeners();
        queue.pause().unwrap();
        queue.status().await.unwrap();
        assert_eq!(seen.lock().len(), 5);
    }

    #[test]
    fn test_merge_attachments_variants() {
        let mut uploads = UploadRegistry::new();
        uploads.register("a", UploadOptions::default());
        uploads.complete("a", json!("new"));
        uploads.register("pending", UploadOptions::default());
        let ids = vec!["pending".to_string(), "a".to_string()];

        let mut empty = Metadata::new();
        merge_attachments(&mut empty, &ids, &uploads);
        assert_eq!(empty[ATTACHMENTS_KEY], json!(["new"]));

        let mut scalar = metadata(json!({"attachments": "old"})).unwrap();
        merge_attachments(&mut scalar, &ids, &uploads);
        assert_eq!(scalar[ATTACHMENTS_KEY], json!(["old", "new"]));

        let mut null = metadata(json!({"attachments": null})).unwrap();
        merge_attachments(&mut null, &ids, &uploads);
        assert_eq!(null[ATTACHMENTS_KEY], json!(["new"]));

        let mut untouched = metadata(json!({"model": "gpt"})).unwrap();
        merge_attachments(&mut untouched, &["pending".to_string()], &uploads);
        assert!(!untouched.contains_key(ATTACHMENTS_KEY));
    }
}
