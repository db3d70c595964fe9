//! Drive a send queue from the command line: attachments are registered as
//! blocking uploads, every message waits behind them, and each send replays a
//! captured provider response.

use anyhow::Result;
use serde_json::{json, Value};
use services::{send_fn, SendQueue};
use shared::events::QueueEvent;
use shared::queue::{QueueStatus, UploadOptions, ATTACHMENTS_KEY};
use shared::settings::QueueSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::replay::replay_file;

pub type ValueSink = Arc<dyn Fn(&str, Value) + Send + Sync>;

pub struct SessionPlan {
    pub response: PathBuf,
    pub attachments: Vec<PathBuf>,
    pub chunk_size: usize,
    pub messages: Vec<String>,
}

#[derive(Debug)]
pub struct SessionReport {
    pub sent: usize,
    pub failed: usize,
    pub failed_uploads: usize,
    pub status: QueueStatus,
}

/// Stat the file and report it as the upload result.
async fn upload_attachment(path: &Path) -> Result<Value> {
    let meta = tokio::fs::metadata(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(json!({
        "name": name,
        "path": path.display().to_string(),
        "size": meta.len(),
    }))
}

pub async fn run_session(
    settings: QueueSettings,
    plan: SessionPlan,
    on_value: ValueSink,
) -> Result<SessionReport> {
    let queue = SendQueue::new(settings);
    let mut events = queue.subscribe();

    let mut upload_ids = Vec::with_capacity(plan.attachments.len());
    for path in plan.attachments {
        let id = queue.register_upload(None, UploadOptions::default())?;
        upload_ids.push(id.clone());

        let queue = queue.clone();
        tokio::spawn(async move {
            if queue.start_upload(&id).is_err() {
                return;
            }
            let outcome = match upload_attachment(&path).await {
                Ok(result) => queue.complete_upload(&id, result),
                Err(e) => queue.fail_upload(&id, format!("{}: {}", path.display(), e)),
            };
            if outcome.is_err() {
                debug!("queue closed before upload {} finished", id);
            }
        });
    }

    for content in plan.messages {
        let response = plan.response.clone();
        let chunk_size = plan.chunk_size;
        let on_value = Arc::clone(&on_value);
        let id = queue
            .queue_message(
                content,
                None,
                upload_ids.clone(),
                send_fn(move |content: String, metadata| async move {
                    let attached = metadata
                        .get(ATTACHMENTS_KEY)
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len);
                    debug!("sending {:?} with {} attachment(s)", content, attached);
                    let count =
                        replay_file(&response, chunk_size, |v| (*on_value)(&content, v)).await?;
                    debug!("reply carried {} value(s)", count);
                    Ok(())
                }),
            )
            .await?;
        debug!("queued {}", id);
    }

    queue.wait_until_idle().await?;
    let status = queue.status().await?;

    let mut report = SessionReport {
        sent: 0,
        failed: 0,
        failed_uploads: 0,
        status,
    };
    while let Ok(event) = events.try_recv() {
        match event {
            QueueEvent::MessageSent { .. } => report.sent += 1,
            QueueEvent::MessageSendFailed { message_id, error } => {
                warn!("{} failed: {}", message_id, error);
                report.failed += 1;
            }
            QueueEvent::UploadFailed {
                upload_id, error, ..
            } => {
                warn!("upload {} failed: {}", upload_id, error);
                report.failed_uploads += 1;
            }
            other => debug!("{}", other.name()),
        }
    }

    info!(
        "session finished: {} sent, {} failed, {} failed upload(s)",
        report.sent, report.failed, report.failed_uploads
    );
    Ok(report)
}
